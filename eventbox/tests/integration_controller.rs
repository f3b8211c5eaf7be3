//! Integration tests for the box controller.
//!
//! Covers the population-tracking scenario, settings round trips and the
//! file-backing lifecycle against a real container file.

use eventbox::controller::{BoxController, BoxControllerSettings};
use eventbox::error::ErrorKind;
use eventbox::file_io::FileBoxIo;
use eventbox::io::BoxControllerIo;
use eventbox::memory_io::MemoryBoxIo;
use tempfile::tempdir;

/// Lean 2-d backend with double precision: 4 values per event.
fn lean_file_backend() -> Box<FileBoxIo> {
    let mut io = FileBoxIo::new(2);
    io.set_data_type(8, "MDLeanEvent").unwrap();
    Box::new(io)
}

#[test]
fn test_population_scenario() {
    let mut bc = BoxController::new(2).unwrap();
    bc.set_split_into(10).unwrap();
    bc.set_max_depth(4).unwrap();
    assert_eq!(bc.num_split(), 100);
    assert_eq!(bc.num_md_boxes(), &[1, 0, 0, 0, 0]);

    bc.track_num_boxes(0).unwrap();
    assert_eq!(bc.num_md_boxes(), &[0, 100, 0, 0, 0]);
    assert!((bc.average_depth() - 1.0).abs() < 1e-9);

    bc.track_num_boxes(1).unwrap();
    bc.track_num_boxes(1).unwrap();
    assert_eq!(bc.num_md_boxes(), &[0, 98, 200, 0, 0]);
    assert!((bc.average_depth() - 1.02).abs() < 1e-9);
    assert_eq!(bc.total_num_md_boxes(), 298);
    assert_eq!(bc.total_num_md_grid_boxes(), 3);
}

#[test]
fn test_num_split_is_product_of_fan_outs() {
    for n_dims in 1..=4 {
        let mut bc = BoxController::new(n_dims).unwrap();
        let mut expected = 1;
        for dim in 0..n_dims {
            let n = dim + 2;
            bc.set_split_into_dim(dim, n).unwrap();
            expected *= n;
        }
        assert_eq!(bc.num_split(), expected);
    }
}

#[test]
fn test_will_split_truth_table() {
    let mut bc = BoxController::new(1).unwrap();
    for max_depth in [0, 1, 3] {
        for threshold in [0, 5, 100] {
            bc.set_max_depth(max_depth).unwrap();
            bc.set_split_threshold(threshold);
            for signal in [0, 5, 6, 101] {
                for depth in 0..5 {
                    assert_eq!(
                        bc.will_split(signal, depth),
                        signal > threshold && depth < max_depth,
                        "signal {signal} depth {depth} threshold {threshold} max {max_depth}"
                    );
                }
            }
        }
    }
}

#[test]
fn test_xml_round_trip_with_partial_top_override() {
    let mut bc = BoxController::new(3).unwrap();
    bc.set_split_into(3).unwrap();
    bc.set_split_top_into(2, 8).unwrap();
    bc.set_max_depth(6).unwrap();
    bc.set_split_threshold(42);
    for _ in 0..17 {
        bc.next_id();
    }
    bc.track_num_boxes(0).unwrap();
    bc.track_num_boxes(1).unwrap();

    let xml = bc.to_xml_string();
    let restored = BoxController::from_xml_string(&xml).unwrap();
    assert_eq!(restored, bc);
    assert_eq!(restored.split_top_into(), Some(vec![3, 3, 8]));
    assert_eq!(restored.max_id(), 17);
    assert_eq!(restored.num_md_boxes(), bc.num_md_boxes());
    assert_eq!(restored.average_depth(), bc.average_depth());

    // Two controllers from the same blob are equal to each other.
    assert_eq!(BoxController::from_xml_string(&xml).unwrap(), restored);
}

#[test]
fn test_settings_from_json_config() {
    let json = r#"{
        "n_dims": 3,
        "split_into": [2, 2, 4],
        "split_top_into": [null, 10, null],
        "split_threshold": 250,
        "max_depth": 3
    }"#;
    let settings: BoxControllerSettings = serde_json::from_str(json).unwrap();
    let bc = BoxController::from_settings(&settings).unwrap();
    assert_eq!(bc.num_split(), 16);
    assert_eq!(bc.num_split_for_depth(0), 80);
    assert_eq!(bc.num_md_boxes(), &[1, 0, 0, 0]);
    assert_eq!(bc.max_num_md_boxes(), &[1.0, 80.0, 1280.0, 20480.0]);

    let bad = json.replace("[2, 2, 4]", "[2, 0, 4]");
    let err = BoxController::from_json(&bad).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn test_clone_of_file_backed_controller() {
    let dir = tempdir().unwrap();
    let mut bc = BoxController::new(2).unwrap();
    bc.set_split_into(4).unwrap();
    bc.set_file_backed(lean_file_backend(), dir.path().join("clone.evbx"))
        .unwrap();

    let copy = bc.clone();
    assert!(bc.is_file_backed());
    assert!(!copy.is_file_backed());
    assert_eq!(copy, bc);
}

#[test]
fn test_clear_file_backed_flushes_buffer() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("flush.evbx");

    let mut bc = BoxController::new(2).unwrap();
    bc.set_file_backed(lean_file_backend(), &path).unwrap();

    let buffer = bc.file_io_mut().unwrap();
    buffer.save_block(5, vec![1.0, 1.0, 0.25, 0.75]).unwrap();
    buffer
        .save_block(6, vec![2.0, 4.0, 0.5, 0.5, 3.0, 9.0, 0.125, 0.875])
        .unwrap();
    assert_eq!(buffer.buffered_count(), 2);
    assert_eq!(buffer.io().file_length(), 0);

    bc.clear_file_backed().unwrap();
    assert!(!bc.is_file_backed());

    let info = FileBoxIo::inspect(&path).unwrap();
    assert_eq!(info.event_count, 3);
    assert_eq!(info.n_dims, 2);
}

#[test]
fn test_drop_flushes_buffer() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("drop.evbx");

    {
        let mut bc = BoxController::new(2).unwrap();
        bc.set_file_backed(lean_file_backend(), &path).unwrap();
        bc.file_io_mut()
            .unwrap()
            .save_block(1, vec![1.0, 1.0, 0.0, 0.0])
            .unwrap();
    }

    let info = FileBoxIo::inspect(&path).unwrap();
    assert_eq!(info.event_count, 1);
}

#[test]
fn test_set_file_backed_replaces_previous_backing() {
    let dir = tempdir().unwrap();
    let first = dir.path().join("first.evbx");
    let second = dir.path().join("second.evbx");

    let mut bc = BoxController::new(2).unwrap();
    bc.set_file_backed(lean_file_backend(), &first).unwrap();
    bc.file_io_mut()
        .unwrap()
        .save_block(0, vec![1.0, 1.0, 0.5, 0.5])
        .unwrap();

    bc.set_file_backed(lean_file_backend(), &second).unwrap();
    assert_eq!(
        bc.file_io().unwrap().io().file_name(),
        Some(second.as_path())
    );
    assert_eq!(FileBoxIo::inspect(&first).unwrap().event_count, 1);
}

#[test]
fn test_set_file_backed_with_open_backend() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("preopened.evbx");

    let mut io = lean_file_backend();
    io.open_file(&path, "w").unwrap();

    let mut bc = BoxController::new(2).unwrap();
    // The hint is ignored for a backend that is already open.
    bc.set_file_backed(io, dir.path().join("ignored.evbx"))
        .unwrap();
    assert_eq!(bc.file_io().unwrap().io().file_name(), Some(path.as_path()));
    assert!(!dir.path().join("ignored.evbx").exists());
}

#[test]
fn test_file_backing_errors() {
    let mut bc = BoxController::new(2).unwrap();
    assert!(bc.file_io().is_none());
    let err = bc.require_file_io("paging").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RuntimeError);
    assert!(err.to_string().contains("paging"));

    let err = bc
        .set_file_backed(Box::new(MemoryBoxIo::new(4)), "wrong-dims")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let dir = tempdir().unwrap();
    let missing = dir.path().join("missing").join("deeper.evbx");
    let err = bc
        .set_file_backed(lean_file_backend(), &missing)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FileError);
    assert!(!bc.is_file_backed());
}

#[test]
fn test_failed_flush_does_not_truncate_new_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("existing.evbx");
    std::fs::write(&path, b"not yet replaced").unwrap();

    let mut old = MemoryBoxIo::new(2);
    old.set_data_type(8, "MDLeanEvent").unwrap();
    let control = old.control();
    let mut bc = BoxController::new(2).unwrap();
    bc.set_file_backed(Box::new(old), "in-memory").unwrap();
    bc.file_io_mut()
        .unwrap()
        .save_block(3, vec![1.0, 1.0, 0.25, 0.75])
        .unwrap();

    control.set_fail_writes(true);
    let err = bc.set_file_backed(lean_file_backend(), &path).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FileError);
    assert_eq!(std::fs::read(&path).unwrap(), b"not yet replaced");
    assert!(bc.file_io().unwrap().is_buffered(3));

    control.set_fail_writes(false);
    bc.set_file_backed(lean_file_backend(), &path).unwrap();
    assert_eq!(control.counters().blocks_written, 1);
    bc.clear_file_backed().unwrap();
    assert_eq!(FileBoxIo::inspect(&path).unwrap().event_count, 0);
}
