//! Metadata-framed streams round-trip bytewise through the fabric.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use pipebus::frames::image_format;
use pipebus::{
    client, server, CameraMeta, ClientFlags, EndpointInfo, PointCloudFormat, PointCloudMeta,
    ServerFlags,
};

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

#[test]
fn camera_frames_round_trip() {
    let _ = env_logger::builder().is_test(true).try_init();
    let tmp = tempfile::tempdir().unwrap();
    let dir = format!("{}/cam/", tmp.path().to_str().unwrap());

    let mut info = EndpointInfo::new("cam", "camera", "cam-server", 1024 * 1024);
    info.location = dir.clone();
    server::create(0, info, ServerFlags::empty()).unwrap();

    type Got = (i32, i16, i16, Vec<u8>);
    let frames: Arc<Mutex<Vec<Got>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = frames.clone();
    client::set_camera_cb(0, move |_ch, meta, payload| {
        sink.lock()
            .unwrap()
            .push((meta.frame_id, meta.width, meta.height, payload.to_vec()));
    })
    .unwrap();
    // Deliberately small initial buffer; the helper grows it on demand.
    client::open(0, &dir, "viewer", ClientFlags::EN_CAMERA_HELPER, 64).unwrap();
    wait_for("attach", || server::num_clients(0).unwrap() == 1);

    let mut meta = CameraMeta::new();
    meta.width = 32;
    meta.height = 24;
    meta.stride = 32;
    meta.format = image_format::RAW8;
    for frame_id in 0..5i32 {
        let payload: Vec<u8> = (0..32u32 * 24)
            .map(|i| (i as u8).wrapping_add(frame_id as u8))
            .collect();
        meta.frame_id = frame_id;
        meta.size_bytes = payload.len() as u32;
        server::write_camera(0, &meta, &payload).unwrap();
        wait_for("frame", || frames.lock().unwrap().len() == frame_id as usize + 1);
    }

    let got = frames.lock().unwrap();
    assert_eq!(got.len(), 5);
    for (frame_id, (id, w, h, payload)) in got.iter().enumerate() {
        assert_eq!(*id, frame_id as i32);
        assert_eq!((*w, *h), (32, 24));
        let expect: Vec<u8> = (0..32u32 * 24)
            .map(|i| (i as u8).wrapping_add(frame_id as u8))
            .collect();
        assert_eq!(payload, &expect);
    }
    drop(got);

    client::close(0).unwrap();
    server::close(0).unwrap();
}

#[test]
fn stereo_pair_splits_evenly() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = format!("{}/stereo/", tmp.path().to_str().unwrap());

    let mut info = EndpointInfo::new("stereo", "camera", "cam-server", 1024 * 1024);
    info.location = dir.clone();
    server::create(1, info, ServerFlags::empty()).unwrap();

    let frames: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = frames.clone();
    client::set_camera_cb(1, move |_ch, _meta, payload| {
        sink.lock().unwrap().push(payload.to_vec());
    })
    .unwrap();
    client::open(1, &dir, "viewer", ClientFlags::EN_CAMERA_HELPER, 64).unwrap();
    wait_for("attach", || server::num_clients(1).unwrap() == 1);

    let left = vec![0xAAu8; 256];
    let right = vec![0xBBu8; 256];
    let mut meta = CameraMeta::new();
    meta.width = 16;
    meta.height = 16;
    meta.format = image_format::STEREO_RAW8;
    meta.size_bytes = 512;
    server::write_stereo_camera(1, &meta, &left, &right).unwrap();

    wait_for("stereo frame", || frames.lock().unwrap().len() == 1);
    let got = frames.lock().unwrap();
    assert_eq!(&got[0][..256], &left[..]);
    assert_eq!(&got[0][256..], &right[..]);
    drop(got);

    // Mismatched halves are rejected up front.
    assert!(server::write_stereo_camera(1, &meta, &left, &right[..128]).is_err());

    client::close(1).unwrap();
    server::close(1).unwrap();
}

#[test]
fn point_clouds_round_trip() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = format!("{}/cloud/", tmp.path().to_str().unwrap());

    let mut info = EndpointInfo::new("cloud", "point_cloud", "tof-server", 1024 * 1024);
    info.location = dir.clone();
    server::create(2, info, ServerFlags::empty()).unwrap();

    type Got = (u32, u32, Vec<u8>);
    let clouds: Arc<Mutex<Vec<Got>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = clouds.clone();
    client::set_point_cloud_cb(2, move |_ch, meta, payload| {
        clouds_push(&sink, meta, payload);
    })
    .unwrap();
    client::open(2, &dir, "mapper", ClientFlags::EN_POINT_CLOUD_HELPER, 64).unwrap();
    wait_for("attach", || server::num_clients(2).unwrap() == 1);

    let mut meta = PointCloudMeta::new();
    meta.n_points = 100;
    meta.format = PointCloudFormat::FloatXyz as u32;
    meta.id = 7;
    let payload: Vec<u8> = (0..100 * 12).map(|i| i as u8).collect();
    server::write_point_cloud(2, &meta, &payload).unwrap();

    wait_for("cloud", || clouds.lock().unwrap().len() == 1);
    let got = clouds.lock().unwrap();
    assert_eq!(got[0].0, 100);
    assert_eq!(got[0].1, 7);
    assert_eq!(got[0].2, payload);
    drop(got);

    // A payload that disagrees with the stride table is rejected.
    assert!(server::write_point_cloud(2, &meta, &payload[..50]).is_err());

    client::close(2).unwrap();
    server::close(2).unwrap();
}

fn clouds_push(
    sink: &Arc<Mutex<Vec<(u32, u32, Vec<u8>)>>>,
    meta: &PointCloudMeta,
    payload: &[u8],
) {
    let n_points = meta.n_points;
    let id = meta.id;
    sink.lock().unwrap().push((n_points, id, payload.to_vec()));
}
