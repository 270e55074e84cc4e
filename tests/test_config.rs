use clap::error::ErrorKind;
use std::path::Path;
use std::time::Duration;
use veil::config::Config;
use veil::rules::RoutingMode;

#[test]
fn test_config_positional_arguments() {
    let cfg = Config::parse_from([
        "veil",
        "/run/docker.sock",
        "/run/veil.sock",
        "/etc/veil.rules",
    ])
    .unwrap();

    assert_eq!(cfg.target_socket, Path::new("/run/docker.sock"));
    assert_eq!(cfg.exposed_socket, Path::new("/run/veil.sock"));
    assert_eq!(cfg.rules_file, Path::new("/etc/veil.rules"));
    assert_eq!(cfg.routing, RoutingMode::Method);
}

#[test]
fn test_config_relay_timeout_is_fixed() {
    let cfg = Config::parse_from(["veil", "a", "b", "c"]).unwrap();
    assert_eq!(cfg.relay_timeout, Duration::from_secs(5));
}

#[test]
fn test_config_path_routing() {
    let cfg = Config::parse_from(["veil", "--routing", "path", "a", "b", "c"]).unwrap();
    assert_eq!(cfg.routing, RoutingMode::Path);

    let err = Config::parse_from(["veil", "--routing", "regex", "a", "b", "c"]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidValue);
}

#[test]
fn test_config_wrong_argument_count() {
    assert!(Config::parse_from(["veil", "a", "b"]).is_err());
    assert!(Config::parse_from(["veil", "a", "b", "c", "d"]).is_err());
    assert!(Config::parse_from(["veil"]).is_err());
}

#[test]
fn test_config_help_is_an_error() {
    let err = Config::parse_from(["veil", "-h"]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DisplayHelp);
}

#[test]
fn test_config_clone() {
    let cfg1 = Config::parse_from(["veil", "a", "b", "c"]).unwrap();
    let cfg2 = cfg1.clone();
    assert_eq!(cfg1.exposed_socket, cfg2.exposed_socket);
}
