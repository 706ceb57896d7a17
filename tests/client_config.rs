use std::sync::Mutex;

use tempfile::{Builder, NamedTempFile};

use weapon_watch::config::{ClientConfig, DetectionModel};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "WEAPON_WATCH_CONFIG",
        "WEAPON_WATCH_ENDPOINT",
        "WEAPON_WATCH_TOKEN",
        "WEAPON_WATCH_TOKEN_PATH",
        "WEAPON_WATCH_CONFIDENCE",
        "WEAPON_WATCH_MODEL",
        "WEAPON_WATCH_CAMERA",
        "WEAPON_WATCH_FONT",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_config_from_json_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "server": {
            "endpoint": "ws://10.0.0.5:8000/api/v1/ws/realtime-detect",
            "confidence": 0.35,
            "model": "fasterrcnn"
        },
        "capture": {
            "encode_width": 480,
            "jpeg_quality": 70
        },
        "display": {
            "width": 960,
            "height": 540,
            "freshness_ms": 750
        },
        "camera": {
            "device": "/dev/video2",
            "target_fps": 15
        },
        "file": {
            "fps": 24
        }
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("WEAPON_WATCH_CONFIG", file.path());
    std::env::set_var("WEAPON_WATCH_CONFIDENCE", "0.6");
    std::env::set_var("WEAPON_WATCH_TOKEN", "op-token");

    let cfg = ClientConfig::load().expect("load config");

    assert_eq!(cfg.endpoint, "ws://10.0.0.5:8000/api/v1/ws/realtime-detect");
    assert!((cfg.confidence - 0.6).abs() < f32::EPSILON);
    assert_eq!(cfg.model, DetectionModel::FasterRcnn);
    assert_eq!(cfg.encode_width, 480);
    assert_eq!(cfg.jpeg_quality, 70);
    assert_eq!((cfg.display.width, cfg.display.height), (960, 540));
    assert_eq!(cfg.freshness.as_millis(), 750);
    assert_eq!(cfg.camera.device, "/dev/video2");
    assert_eq!(cfg.camera.width, 1280);
    assert_eq!(cfg.camera.target_fps, 15);
    assert_eq!(cfg.file_fps, 24);

    let settings = cfg.session_settings().expect("session settings");
    assert_eq!(settings.model, "fasterrcnn");
    assert_eq!(settings.token.as_deref(), Some("op-token"));

    clear_env();
}

#[test]
fn loads_toml_by_extension() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = Builder::new().suffix(".toml").tempfile().expect("temp config");
    let toml = r#"
[server]
model = "yolo"
confidence = 0.25

[camera]
device = "stub://bench"
width = 640
height = 480
"#;
    std::io::Write::write_all(&mut file, toml.as_bytes()).expect("write config");
    std::env::set_var("WEAPON_WATCH_CONFIG", file.path());
    std::env::set_var("WEAPON_WATCH_CAMERA", "/dev/video1");

    let cfg = ClientConfig::load().expect("load config");
    assert_eq!(cfg.model, DetectionModel::Yolo);
    assert!((cfg.confidence - 0.25).abs() < f32::EPSILON);
    assert_eq!(cfg.camera.device, "/dev/video1");
    assert_eq!(cfg.camera.width, 640);

    clear_env();
}

#[test]
fn token_is_read_from_file_when_not_inline() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut token_file = NamedTempFile::new().expect("temp token");
    std::io::Write::write_all(&mut token_file, b"file-token\n").expect("write token");
    std::env::set_var("WEAPON_WATCH_TOKEN_PATH", token_file.path());

    let cfg = ClientConfig::load().expect("load config");
    assert_eq!(cfg.resolve_token().unwrap().as_deref(), Some("file-token"));

    clear_env();
}

#[test]
fn rejects_out_of_range_confidence() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("WEAPON_WATCH_CONFIDENCE", "1.2");
    assert!(ClientConfig::load().is_err());

    std::env::set_var("WEAPON_WATCH_CONFIDENCE", "high");
    assert!(ClientConfig::load().is_err());

    clear_env();
}

#[test]
fn rejects_unknown_model() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("WEAPON_WATCH_MODEL", "ssd");
    let err = ClientConfig::load().unwrap_err();
    assert!(err.to_string().contains("unknown model"));

    clear_env();
}
