//! Detection probe
//!
//! Ordered, read-only checks that describe what is already installed on the
//! host. The probe never fails: a check that cannot complete adds a note and
//! the remaining checks still run.

use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::errors::ProvisionError;
use crate::models::website::DetectionResult;
use crate::session::Session;
use crate::utils::shell_quote;

/// Document roots searched for an existing installation, in order
pub fn candidate_docroots(domain: &str) -> Vec<String> {
    vec![
        format!("/var/www/{}", domain),
        format!("/var/www/{}/public_html", domain),
        format!("/home/{}/public_html", domain),
        "/var/www/html".to_string(),
    ]
}

/// Run every detection check over `session`
pub async fn detect(session: &dyn Session, domain: &str, timeout: Duration) -> DetectionResult {
    let mut result = DetectionResult::default();

    if let Err(e) = check_platform(session, timeout).await {
        note(&mut result, "platform", e);
    }

    match find_docroot(session, domain, timeout).await {
        Ok(Some(docroot)) => {
            result.installed = true;
            result.config_path = Some(format!("{}/wp-config.php", docroot));
            match read_version(session, &docroot, timeout).await {
                Ok(version) => result.version = version,
                Err(e) => note(&mut result, "version", e),
            }
            result.docroot = Some(docroot);
        }
        Ok(None) => {}
        Err(e) => note(&mut result, "docroot", e),
    }

    match find_web_server(session, timeout).await {
        Ok(server) => result.web_server = server,
        Err(e) => note(&mut result, "web_server", e),
    }

    match read_php_version(session, timeout).await {
        Ok(version) => result.php_version = version,
        Err(e) => note(&mut result, "php", e),
    }

    result.checked_at = Some(Utc::now());
    info!(
        installed = result.installed,
        version = result.version.as_deref().unwrap_or("-"),
        notes = result.notes.len(),
        "Detection finished"
    );
    result
}

fn note(result: &mut DetectionResult, check: &str, err: ProvisionError) {
    warn!(check, "Detection check failed: {}", err);
    result.notes.push(format!("{}: {}", check, err));
}

async fn run_check(
    session: &dyn Session,
    command: &str,
    timeout: Duration,
) -> Result<crate::session::CommandOutput, ProvisionError> {
    debug!(command, "Running detection check");
    session
        .execute(command, timeout)
        .await
        .map_err(|e| ProvisionError::Detection(e.to_string()))
}

async fn check_platform(session: &dyn Session, timeout: Duration) -> Result<(), ProvisionError> {
    let output = run_check(session, "uname -s", timeout).await?;
    let platform = output.stdout.trim();
    if !output.success() || platform.is_empty() {
        return Err(ProvisionError::Detection("could not determine platform".to_string()));
    }
    if platform != "Linux" {
        return Err(ProvisionError::Detection(format!("unsupported platform {}", platform)));
    }
    Ok(())
}

async fn find_docroot(
    session: &dyn Session,
    domain: &str,
    timeout: Duration,
) -> Result<Option<String>, ProvisionError> {
    let candidates: Vec<String> = candidate_docroots(domain)
        .iter()
        .map(|d| shell_quote(d))
        .collect();
    let command = format!(
        "for d in {}; do if [ -f \"$d/wp-config.php\" ]; then echo \"$d\"; break; fi; done",
        candidates.join(" ")
    );
    let output = run_check(session, &command, timeout).await?;
    Ok(output
        .stdout
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with('/'))
        .map(str::to_string))
}

async fn read_version(
    session: &dyn Session,
    docroot: &str,
    timeout: Duration,
) -> Result<Option<String>, ProvisionError> {
    let command = format!(
        "cat {}",
        shell_quote(&format!("{}/wp-includes/version.php", docroot))
    );
    let output = run_check(session, &command, timeout).await?;
    if !output.success() {
        return Err(ProvisionError::Detection("version.php not readable".to_string()));
    }
    Ok(parse_wp_version(&output.stdout))
}

async fn find_web_server(session: &dyn Session, timeout: Duration) -> Result<Option<String>, ProvisionError> {
    let output = run_check(
        session,
        "for s in nginx apache2 httpd; do if command -v \"$s\" >/dev/null 2>&1; then echo \"$s\"; break; fi; done",
        timeout,
    )
    .await?;
    let server = output.stdout.trim();
    Ok((!server.is_empty()).then(|| server.to_string()))
}

async fn read_php_version(session: &dyn Session, timeout: Duration) -> Result<Option<String>, ProvisionError> {
    let output = run_check(session, "php -r 'echo PHP_VERSION;' 2>/dev/null", timeout).await?;
    if !output.success() {
        return Ok(None);
    }
    Ok(parse_php_version(&output.stdout))
}

/// Extract `$wp_version = '6.4.2';` from `wp-includes/version.php`
pub fn parse_wp_version(contents: &str) -> Option<String> {
    contents
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with("$wp_version"))
        .and_then(|line| {
            let start = line.find(['\'', '"'])?;
            let quote = line[start..].chars().next()?;
            let rest = &line[start + 1..];
            let end = rest.find(quote)?;
            Some(rest[..end].to_string())
        })
        .filter(|v| !v.is_empty())
}

pub fn parse_php_version(stdout: &str) -> Option<String> {
    let version = stdout.trim();
    let valid = !version.is_empty()
        && version
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '+' || c == '~');
    valid.then(|| version.to_string())
}
