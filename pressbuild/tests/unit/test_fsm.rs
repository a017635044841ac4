//! FSM unit tests

use pressbuild::deploy::fsm::{StatusEvent, StatusFsm, WebsiteStatus};

#[test]
fn test_fsm_initial_state() {
    let fsm = StatusFsm::new(WebsiteStatus::default());
    assert_eq!(fsm.state(), &WebsiteStatus::Pending);
    assert!(fsm.error().is_none());
    assert!(!fsm.state().is_running());
}

#[test]
fn test_fsm_build_failure_flow() {
    let mut fsm = StatusFsm::new(WebsiteStatus::Pending);

    fsm.process(StatusEvent::StartBuild).unwrap();
    assert!(fsm.state().is_running());

    fsm.process(StatusEvent::Fail("apt-get exited with code 100".to_string()))
        .unwrap();
    assert_eq!(fsm.state(), &WebsiteStatus::Failed);
    assert_eq!(fsm.error(), Some("apt-get exited with code 100"));
}

#[test]
fn test_fsm_certificate_failure_flow() {
    let mut fsm = StatusFsm::new(WebsiteStatus::Pending);

    fsm.process(StatusEvent::StartBuild).unwrap();
    fsm.process(StatusEvent::BuildCompleted).unwrap();
    assert_eq!(fsm.state(), &WebsiteStatus::SslProvisioning);

    fsm.process(StatusEvent::Fail("certbot failed".to_string())).unwrap();
    assert_eq!(fsm.state(), &WebsiteStatus::Failed);

    // Resume at the certificate phase
    fsm.process(StatusEvent::StartSsl).unwrap();
    fsm.process(StatusEvent::SslCompleted).unwrap();
    assert_eq!(fsm.state(), &WebsiteStatus::Active);
    assert!(fsm.error().is_none());
}

#[test]
fn test_fsm_reprovision_active() {
    let mut fsm = StatusFsm::new(WebsiteStatus::Active);
    fsm.process(StatusEvent::StartBuild).unwrap();
    assert_eq!(fsm.state(), &WebsiteStatus::Building);
}

#[test]
fn test_fsm_invalid_transition() {
    // Certificate phase needs a completed build
    let mut fsm = StatusFsm::new(WebsiteStatus::Building);
    assert!(fsm.process(StatusEvent::SslCompleted).is_err());
    assert_eq!(fsm.state(), &WebsiteStatus::Building);

    let mut fsm = StatusFsm::new(WebsiteStatus::Active);
    assert!(fsm.process(StatusEvent::Fail("late".to_string())).is_err());
    assert!(fsm.process(StatusEvent::StartSsl).is_err());
}
