//! Encoded-video sequencing: header replay and I/P-frame gating.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use pipebus::frames::image_format;
use pipebus::{client, server, CameraMeta, ClientFlags, EndpointInfo, ServerFlags};

fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("timed out waiting for {}", what);
}

const FRAME_LEN: usize = 32;

fn frame(nal: u8) -> Vec<u8> {
    let mut payload = vec![0u8; FRAME_LEN];
    payload[4] = nal;
    payload
}

fn meta(frame_id: i32) -> CameraMeta {
    let mut meta = CameraMeta::new();
    meta.frame_id = frame_id;
    meta.width = 16;
    meta.height = 16;
    meta.size_bytes = FRAME_LEN as u32;
    meta.format = image_format::H264;
    meta
}

/// A client that attaches mid-stream sees the cached header first, then the
/// next I-frame, then P-frames; never a P-frame before its reference I-frame.
#[test]
fn late_joiner_waits_for_intra_frame() {
    let _ = env_logger::builder().is_test(true).try_init();
    let tmp = tempfile::tempdir().unwrap();
    let dir = format!("{}/video/", tmp.path().to_str().unwrap());

    let mut info = EndpointInfo::new("video", "camera", "video-server", 1024 * 1024);
    info.location = dir.clone();
    server::create(0, info, ServerFlags::empty()).unwrap();

    // header, I, P, P with nobody attached; the header lands in the cache.
    server::write_camera(0, &meta(0), &frame(0x67)).unwrap();
    server::write_camera(0, &meta(1), &frame(0x65)).unwrap();
    server::write_camera(0, &meta(2), &frame(0x41)).unwrap();
    server::write_camera(0, &meta(3), &frame(0x41)).unwrap();

    let seen: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    client::set_camera_cb(0, move |_ch, _meta, payload| {
        sink.lock().unwrap().push(payload[4]);
    })
    .unwrap();
    client::open(0, &dir, "viewer", ClientFlags::EN_CAMERA_HELPER, 1024).unwrap();

    // The replayed header arrives on attach.
    wait_for("header replay", || seen.lock().unwrap().as_slice() == [0x67]);

    // A P-frame before the next I-frame must be withheld from the new client.
    server::write_camera(0, &meta(4), &frame(0x41)).unwrap();
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(seen.lock().unwrap().as_slice(), [0x67]);

    // I-frame opens the gate; the following P-frame flows.
    server::write_camera(0, &meta(5), &frame(0x65)).unwrap();
    wait_for("I frame", || seen.lock().unwrap().len() == 2);
    server::write_camera(0, &meta(6), &frame(0x41)).unwrap();
    wait_for("P frame", || seen.lock().unwrap().len() == 3);
    assert_eq!(seen.lock().unwrap().as_slice(), [0x67, 0x65, 0x41]);

    client::close(0).unwrap();
    server::close(0).unwrap();
}

/// A new header mid-stream closes the gate again until the next I-frame.
#[test]
fn new_header_restarts_the_sequence() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = format!("{}/video2/", tmp.path().to_str().unwrap());

    let mut info = EndpointInfo::new("video2", "camera", "video-server", 1024 * 1024);
    info.location = dir.clone();
    server::create(1, info, ServerFlags::empty()).unwrap();

    let seen: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    client::set_camera_cb(1, move |_ch, _meta, payload| {
        sink.lock().unwrap().push(payload[4]);
    })
    .unwrap();
    client::open(1, &dir, "viewer", ClientFlags::EN_CAMERA_HELPER, 1024).unwrap();
    wait_for("attach", || server::num_clients(1).unwrap() == 1);

    server::write_camera(1, &meta(0), &frame(0x67)).unwrap();
    server::write_camera(1, &meta(1), &frame(0x65)).unwrap();
    server::write_camera(1, &meta(2), &frame(0x41)).unwrap();
    wait_for("first sequence", || seen.lock().unwrap().len() == 3);

    // Fresh header: the P-frame right after it is dropped, the I-frame and
    // the P-frame after that are delivered.
    server::write_camera(1, &meta(3), &frame(0x67)).unwrap();
    wait_for("second header", || seen.lock().unwrap().len() == 4);
    server::write_camera(1, &meta(4), &frame(0x41)).unwrap();
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(seen.lock().unwrap().len(), 4);
    server::write_camera(1, &meta(5), &frame(0x65)).unwrap();
    server::write_camera(1, &meta(6), &frame(0x41)).unwrap();
    wait_for("gate reopened", || seen.lock().unwrap().len() == 6);
    assert_eq!(
        seen.lock().unwrap().as_slice(),
        [0x67, 0x65, 0x41, 0x67, 0x65, 0x41]
    );

    client::close(1).unwrap();
    server::close(1).unwrap();
}

/// Unclassifiable frames (B-frames) are not fanned out.
#[test]
fn unclassified_frames_are_dropped() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = format!("{}/video3/", tmp.path().to_str().unwrap());

    let mut info = EndpointInfo::new("video3", "camera", "video-server", 1024 * 1024);
    info.location = dir.clone();
    server::create(2, info, ServerFlags::empty()).unwrap();

    let seen: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    client::set_camera_cb(2, move |_ch, _meta, payload| {
        sink.lock().unwrap().push(payload[4]);
    })
    .unwrap();
    client::open(2, &dir, "viewer", ClientFlags::EN_CAMERA_HELPER, 1024).unwrap();
    wait_for("attach", || server::num_clients(2).unwrap() == 1);

    server::write_camera(2, &meta(0), &frame(0x67)).unwrap();
    server::write_camera(2, &meta(1), &frame(0x99)).unwrap();
    server::write_camera(2, &meta(2), &frame(0x65)).unwrap();
    wait_for("good frames", || seen.lock().unwrap().len() == 2);
    assert_eq!(seen.lock().unwrap().as_slice(), [0x67, 0x65]);

    client::close(2).unwrap();
    server::close(2).unwrap();
}
