//! Provisioning blueprints
//!
//! A blueprint turns a website and its detection result into the ordered
//! steps of the build and certificate phases.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::deploy::step::{ScriptStep, Step};
use crate::models::website::DetectionResult;
use crate::utils::{sha256_hash, shell_quote};

/// Where the per-site database secret lives on the remote host
pub const REMOTE_SECRET_DIR: &str = "/etc/pressbuild";

/// MySQL user names are limited to 32 characters
const SLUG_MAX_LEN: usize = 32;
const SLUG_PREFIX_LEN: usize = 23;

/// Everything a blueprint needs to plan a run
#[derive(Debug, Clone)]
pub struct SiteContext {
    pub website_id: String,
    pub domain: String,
    /// Prefix privileged commands with `sudo -n`
    pub use_sudo: bool,
    pub docroot: String,
    pub detection: DetectionResult,
}

impl SiteContext {
    pub fn new(website_id: &str, domain: &str, use_sudo: bool, detection: DetectionResult) -> Self {
        let docroot = detection
            .docroot
            .clone()
            .unwrap_or_else(|| format!("/var/www/{}", domain));
        Self {
            website_id: website_id.to_string(),
            domain: domain.to_string(),
            use_sudo,
            docroot,
            detection,
        }
    }

    /// Identifier safe for database and file names, at most 32 chars.
    ///
    /// Long domains keep a 20 char prefix plus a short digest of the full
    /// domain so that distinct domains never share a database.
    pub fn slug(&self) -> String {
        let domain = self.domain.to_ascii_lowercase();
        let mut slug: String = domain
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        slug.insert_str(0, "wp_");
        if slug.len() > SLUG_MAX_LEN {
            slug.truncate(SLUG_PREFIX_LEN);
            slug.push('_');
            slug.push_str(&sha256_hash(domain.as_bytes())[..8]);
        }
        slug
    }

    fn secret_file(&self) -> String {
        format!("{}/{}.db", REMOTE_SECRET_DIR, self.slug())
    }

    fn site_config(&self) -> String {
        format!("/etc/nginx/sites-available/{}", self.domain)
    }

    /// Wrap `script` so it runs as root
    pub fn privileged(&self, script: &str) -> String {
        if self.use_sudo {
            format!("sudo -n bash -c {}", shell_quote(script))
        } else {
            format!("bash -c {}", shell_quote(script))
        }
    }
}

/// Plans the steps for each phase
pub trait Blueprint: Send + Sync {
    fn build_steps(&self, ctx: &SiteContext) -> Vec<Box<dyn Step>>;

    fn ssl_steps(&self, ctx: &SiteContext) -> Vec<Box<dyn Step>>;
}

/// WordPress blueprint options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlueprintOptions {
    /// Administrator account created by the installer
    #[serde(default = "default_admin_user")]
    pub admin_user: String,

    /// Contact for the administrator account and the certificate authority
    #[serde(default = "default_admin_email")]
    pub admin_email: String,

    /// Request certificates from the CA staging environment
    #[serde(default)]
    pub certificate_staging: bool,

    /// Timeout for package installation, which dominates the build
    #[serde(default = "default_package_timeout")]
    pub package_timeout_secs: u64,
}

fn default_admin_user() -> String {
    "admin".to_string()
}

fn default_admin_email() -> String {
    "admin@localhost".to_string()
}

fn default_package_timeout() -> u64 {
    900
}

impl Default for BlueprintOptions {
    fn default() -> Self {
        Self {
            admin_user: default_admin_user(),
            admin_email: default_admin_email(),
            certificate_staging: false,
            package_timeout_secs: default_package_timeout(),
        }
    }
}

const PACKAGES: &str =
    "nginx php-fpm php-mysql php-curl php-xml php-mbstring php-zip php-gd mariadb-server curl";

const WP_CLI_URL: &str = "https://raw.githubusercontent.com/wp-cli/builds/gh-pages/phar/wp-cli.phar";

/// Locates the php-fpm socket, since its path carries the PHP version
const FIND_PHP_SOCKET: &str = "SOCK=$(ls /run/php/php*-fpm.sock 2>/dev/null | head -n1)\n\
[ -n \"$SOCK\" ] || { echo 'php-fpm socket not found' >&2; exit 1; }";

/// WordPress on nginx, PHP-FPM and MariaDB with a Let's Encrypt certificate
#[derive(Debug, Clone, Default)]
pub struct WordPressBlueprint {
    options: BlueprintOptions,
}

impl WordPressBlueprint {
    pub fn new(options: BlueprintOptions) -> Self {
        Self { options }
    }

    fn install_packages(&self, ctx: &SiteContext) -> ScriptStep {
        let apply = format!(
            "set -e\nexport DEBIAN_FRONTEND=noninteractive\n\
             apt-get update -q\n\
             apt-get install -y -q {}\n\
             systemctl enable --now nginx mariadb",
            PACKAGES
        );
        ScriptStep::new("install_packages", "Installing server packages", ctx.privileged(&apply))
            .with_check(ctx.privileged(&format!(
                "dpkg -s {} >/dev/null 2>&1 && systemctl is-active --quiet nginx mariadb",
                PACKAGES
            )))
            .with_timeout(Duration::from_secs(self.options.package_timeout_secs))
    }

    fn prepare_database(&self, ctx: &SiteContext) -> ScriptStep {
        let slug = ctx.slug();
        let secret = ctx.secret_file();
        let apply = format!(
            "set -e\n\
             install -d -m 700 {dir}\n\
             if [ ! -s {secret} ]; then\n  umask 077\n  openssl rand -hex 16 > {secret} || head -c 16 /dev/urandom | od -An -tx1 | tr -d ' \\n' > {secret}\nfi\n\
             PASS=$(cat {secret})\n\
             mysql -e \"CREATE DATABASE IF NOT EXISTS {slug} DEFAULT CHARACTER SET utf8mb4; \
             CREATE USER IF NOT EXISTS '{slug}'@'localhost' IDENTIFIED BY '$PASS'; \
             ALTER USER '{slug}'@'localhost' IDENTIFIED BY '$PASS'; \
             GRANT ALL PRIVILEGES ON {slug}.* TO '{slug}'@'localhost'; FLUSH PRIVILEGES;\"",
            dir = REMOTE_SECRET_DIR,
            secret = secret,
            slug = slug,
        );
        ScriptStep::new("prepare_database", "Creating database", ctx.privileged(&apply)).with_check(
            ctx.privileged(&format!(
                "test -s {} && mysql -e 'USE {}'",
                secret, slug
            )),
        )
    }

    fn install_cms(&self, ctx: &SiteContext) -> ScriptStep {
        let docroot = shell_quote(&ctx.docroot);
        let apply = format!(
            "set -e\n\
             if ! command -v wp >/dev/null 2>&1; then\n  curl -fsSL -o /usr/local/bin/wp {url}\n  chmod +x /usr/local/bin/wp\nfi\n\
             install -d {docroot}\n\
             wp core download --path={docroot} --force --allow-root\n\
             chown -R www-data:www-data {docroot}",
            url = WP_CLI_URL,
            docroot = docroot,
        );
        ScriptStep::new("install_cms", "Downloading WordPress", ctx.privileged(&apply))
            .with_check(ctx.privileged(&format!(
                "test -f {}/wp-includes/version.php",
                docroot
            )))
    }

    fn configure_cms(&self, ctx: &SiteContext) -> ScriptStep {
        let docroot = shell_quote(&ctx.docroot);
        let slug = ctx.slug();
        let apply = format!(
            "set -e\n\
             PASS=$(cat {secret})\n\
             if [ ! -f {docroot}/wp-config.php ]; then\n  \
             wp config create --path={docroot} --dbname={slug} --dbuser={slug} --dbpass=\"$PASS\" --dbhost=localhost --allow-root\nfi\n\
             wp core install --path={docroot} --url={url} --title={title} --admin_user={user} --admin_email={email} --skip-email --allow-root\n\
             chown -R www-data:www-data {docroot}",
            secret = ctx.secret_file(),
            docroot = docroot,
            slug = slug,
            url = shell_quote(&format!("http://{}", ctx.domain)),
            title = shell_quote(&ctx.domain),
            user = shell_quote(&self.options.admin_user),
            email = shell_quote(&self.options.admin_email),
        );
        ScriptStep::new("configure_cms", "Configuring WordPress", ctx.privileged(&apply)).with_check(
            ctx.privileged(&format!(
                "wp core is-installed --path={} --allow-root",
                docroot
            )),
        )
    }

    fn http_server_block(&self, ctx: &SiteContext) -> String {
        format!(
            "# managed by pressbuild: {domain}\n\
             server {{\n    listen 80;\n    listen [::]:80;\n    server_name {domain} www.{domain};\n    root {docroot};\n    index index.php index.html;\n\
             \x20   location /.well-known/acme-challenge/ {{ root {docroot}; }}\n\
             \x20   location / {{ try_files $uri $uri/ /index.php?$args; }}\n\
             \x20   location ~ \\.php$ {{\n        include snippets/fastcgi-php.conf;\n        fastcgi_pass unix:__PHP_SOCK__;\n    }}\n}}\n",
            domain = ctx.domain,
            docroot = ctx.docroot,
        )
    }

    fn tls_server_blocks(&self, ctx: &SiteContext) -> String {
        format!(
            "# managed by pressbuild: {domain}\n\
             server {{\n    listen 80;\n    listen [::]:80;\n    server_name {domain} www.{domain};\n\
             \x20   location /.well-known/acme-challenge/ {{ root {docroot}; }}\n\
             \x20   location / {{ return 301 https://$host$request_uri; }}\n}}\n\
             server {{\n    listen 443 ssl;\n    listen [::]:443 ssl;\n    server_name {domain} www.{domain};\n    root {docroot};\n    index index.php index.html;\n\
             \x20   ssl_certificate /etc/letsencrypt/live/{domain}/fullchain.pem;\n\
             \x20   ssl_certificate_key /etc/letsencrypt/live/{domain}/privkey.pem;\n\
             \x20   location / {{ try_files $uri $uri/ /index.php?$args; }}\n\
             \x20   location ~ \\.php$ {{\n        include snippets/fastcgi-php.conf;\n        fastcgi_pass unix:__PHP_SOCK__;\n    }}\n}}\n",
            domain = ctx.domain,
            docroot = ctx.docroot,
        )
    }

    /// Script that renders `config` with the php-fpm socket and enables it
    fn write_site_config(&self, ctx: &SiteContext, config: &str) -> String {
        let available = shell_quote(&ctx.site_config());
        format!(
            "set -e\n{find}\n\
             printf '%s' {config} | sed \"s#__PHP_SOCK__#$SOCK#\" > {available}\n\
             ln -sf {available} {enabled}\n\
             nginx -t",
            find = FIND_PHP_SOCKET,
            config = shell_quote(config),
            available = available,
            enabled = shell_quote(&format!("/etc/nginx/sites-enabled/{}", ctx.domain)),
        )
    }

    fn configure_web_server(&self, ctx: &SiteContext) -> ScriptStep {
        let apply = format!(
            "{}\nsystemctl reload nginx",
            self.write_site_config(ctx, &self.http_server_block(ctx))
        );
        ScriptStep::new("configure_web_server", "Configuring web server", ctx.privileged(&apply))
            .with_check(ctx.privileged(&format!(
                "test -L {} && grep -q 'managed by pressbuild' {}",
                shell_quote(&format!("/etc/nginx/sites-enabled/{}", ctx.domain)),
                shell_quote(&ctx.site_config())
            )))
    }

    fn validate_domain(&self, ctx: &SiteContext) -> ScriptStep {
        let domain = shell_quote(&ctx.domain);
        let apply = format!(
            "set -e\n\
             getent ahosts {domain} >/dev/null || {{ echo \"{plain} does not resolve\" >&2; exit 1; }}\n\
             DIR={docroot}/.well-known/acme-challenge\n\
             install -d \"$DIR\"\n\
             TOKEN=pressbuild-$(date +%s)\n\
             echo ok > \"$DIR/$TOKEN\"\n\
             trap 'rm -f \"$DIR/$TOKEN\"' EXIT\n\
             curl -fsS --max-time 15 \"http://{plain}/.well-known/acme-challenge/$TOKEN\" | grep -q ok \
             || {{ echo \"{plain} is not served by this host over HTTP\" >&2; exit 1; }}",
            domain = domain,
            plain = ctx.domain,
            docroot = shell_quote(&ctx.docroot),
        );
        ScriptStep::new("validate_domain", "Validating domain", ctx.privileged(&apply))
    }

    fn request_certificate(&self, ctx: &SiteContext) -> ScriptStep {
        let staging = if self.options.certificate_staging { " --staging" } else { "" };
        let apply = format!(
            "set -e\n\
             if ! command -v certbot >/dev/null 2>&1; then\n  export DEBIAN_FRONTEND=noninteractive\n  apt-get install -y -q certbot\nfi\n\
             certbot certonly --webroot -w {docroot} -d {domain} --non-interactive --agree-tos -m {email} --keep-until-expiring{staging}",
            docroot = shell_quote(&ctx.docroot),
            domain = shell_quote(&ctx.domain),
            email = shell_quote(&self.options.admin_email),
            staging = staging,
        );
        ScriptStep::new("request_certificate", "Requesting certificate", ctx.privileged(&apply))
            .with_check(ctx.privileged(&format!(
                "test -s {}",
                shell_quote(&format!("/etc/letsencrypt/live/{}/fullchain.pem", ctx.domain))
            )))
    }

    fn install_certificate(&self, ctx: &SiteContext) -> ScriptStep {
        ScriptStep::new(
            "install_certificate",
            "Installing certificate",
            ctx.privileged(&self.write_site_config(ctx, &self.tls_server_blocks(ctx))),
        )
        .with_check(ctx.privileged(&format!(
            "grep -q 'listen 443 ssl' {}",
            shell_quote(&ctx.site_config())
        )))
    }

    fn reload_web_server(&self, ctx: &SiteContext) -> ScriptStep {
        ScriptStep::new(
            "reload_web_server",
            "Reloading web server",
            ctx.privileged("nginx -t && systemctl reload nginx"),
        )
    }
}

impl Blueprint for WordPressBlueprint {
    fn build_steps(&self, ctx: &SiteContext) -> Vec<Box<dyn Step>> {
        vec![
            Box::new(self.install_packages(ctx)),
            Box::new(self.prepare_database(ctx)),
            Box::new(self.install_cms(ctx)),
            Box::new(self.configure_cms(ctx)),
            Box::new(self.configure_web_server(ctx)),
        ]
    }

    fn ssl_steps(&self, ctx: &SiteContext) -> Vec<Box<dyn Step>> {
        vec![
            Box::new(self.validate_domain(ctx)),
            Box::new(self.request_certificate(ctx)),
            Box::new(self.install_certificate(ctx)),
            Box::new(self.reload_web_server(ctx)),
        ]
    }
}
