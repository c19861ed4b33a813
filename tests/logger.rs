use layerstack::{LayerOptions, LayerStack, logger};
use log::LevelFilter;

#[test]
fn session_log_records_engine_activity() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("logs").join("session.log");
    std::fs::create_dir_all(dir.path().join("logs")).unwrap();
    std::fs::write(&path, "stale content from an earlier session\n").unwrap();

    let installed = logger::init(Some(&path), LevelFilter::Debug).unwrap();
    assert_eq!(installed, path);
    assert_eq!(logger::log_path(), Some(path.as_path()));

    let mut stack = LayerStack::new(8, 8).unwrap();
    stack.add_layer(Some("Logged"), LayerOptions::default()).unwrap();
    assert!(!stack.remove_layer(9));
    log::logger().flush();

    let text = std::fs::read_to_string(&path).unwrap();
    assert!(!text.contains("stale content"));
    assert!(text.contains("session started"));
    assert!(text.contains("[DEBUG]") && text.contains("add layer 'Logged'"));
    assert!(text.contains("[WARN]") && text.contains("remove_layer(9) rejected"));

    // A second init keeps the first file.
    let again = logger::init(Some(&dir.path().join("other.log")), LevelFilter::Info).unwrap();
    assert_eq!(again, path);
}
