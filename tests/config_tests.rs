// SPDX-License-Identifier: MPL-2.0

//! Integration tests for configuration module

use kinect3d::config::{ProjectorConfig, SourceConfig};
use kinect3d::{Config, ErrorKind};

#[test]
fn test_config_default() {
    // Test that default config can be created
    let config = Config::default();

    // Check sensible defaults
    assert_eq!(config.projector.triangle_depth_range, 5.0);
    assert!(config.file_source.realtime, "Replay should be paced by default");
    assert!(config.validate().is_ok());
    assert!(config.calibration.config_dir.ends_with("kinect3d"));
}

#[test]
fn test_config_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("kinect3d.json");
    let mut config = Config::default();
    config.source = SourceConfig::Multiplexed {
        address: "127.0.0.1:26000".to_string(),
    };
    config.projector.filter_depth_frames = true;
    config.save(&path).unwrap();

    let loaded = Config::load(&path).unwrap();
    assert_eq!(loaded, config);
}

#[test]
fn test_partial_json_uses_defaults() {
    let config = Config::from_json(
        r#"{ "source": { "type": "file", "depth": "a.depth", "color": "a.color" } }"#,
    )
    .unwrap();
    assert!(matches!(config.source, SourceConfig::File { .. }));
    assert_eq!(config.projector, ProjectorConfig::default());
}

#[test]
fn test_invalid_values_are_rejected() {
    let cases = [
        r#"{ "projector": { "triangle_depth_range": 0.0 } }"#,
        r#"{ "projector": { "temporal_alpha": 1.5 } }"#,
        r#"{ "depth_range": { "min": 500, "max": 400 } }"#,
        r#"{ "calibration": { "depth_correction_degree": 21 } }"#,
        r#"{ "source": { "type": "direct" } }"#,
        r#"{ "source": { "type": "multiplexed", "address": "localhost" } }"#,
        "not json",
    ];
    for case in cases {
        let err = Config::from_json(case).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument, "case {}", case);
    }
}

#[test]
fn test_missing_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let err = Config::load(&dir.path().join("absent.json")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}
