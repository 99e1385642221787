//! Daemons served over TCP and driven through `DaemonProxy`.

use obs_core::capabilities::{CameraUnit, Compass, FilterWheel, MountStatus, MountUnit, Relay};
use obs_core::control::{CameraControl, FilterControl, MountControl, MountInfo, Pingable};
use obs_core::retry::retry_until;
use obs_core::{DaemonStatus, LoopTiming, ObsError, ObsResult};
use obs_daemons::cam::{CamDaemon, CameraSlot};
use obs_daemons::exq::{ExqDaemon, ExqDependencies, ExqInfo, ExqSettings};
use obs_daemons::filt::{FiltDaemon, FilterUnit};
use obs_daemons::{MntDaemon, PowerDaemon};
use obs_driver_mock::{MockCamera, MockFilterWheel, MockMount, MockRelay};
use obs_server::{serve, DaemonProxy, RpcDaemon};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

const CALL_TIMEOUT: Duration = Duration::from_secs(3);

async fn start_server<D: RpcDaemon>(daemon: D) -> (DaemonProxy, JoinHandle<ObsResult<()>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let id = daemon.core().id().to_string();
    let server = tokio::spawn(serve(listener, Arc::new(daemon)));
    (DaemonProxy::new(id, addr, CALL_TIMEOUT), server)
}

#[tokio::test]
async fn test_common_methods_and_shutdown() {
    let mount = Arc::new(MockMount::new());
    let (mnt, worker) =
        MntDaemon::start(Arc::clone(&mount) as Arc<dyn MountUnit>, LoopTiming::fast());
    let (proxy, server) = start_server(mnt).await;

    assert_eq!(proxy.ping().await.unwrap(), "ping");
    let snapshot = proxy.get_info::<MountInfo>(true).await.unwrap();
    assert_eq!(snapshot.daemon_id, "mnt");
    assert_eq!(proxy.status().await.unwrap(), DaemonStatus::Running);

    let ack = MountControl::offset(&proxy, Compass::E, 1.32).await.unwrap();
    assert_eq!(ack, "Offsetting E by 1.32 arcsec");
    retry_until(
        Duration::from_secs(2),
        Duration::from_millis(5),
        "offset issued",
        || async { ObsResult::Ok((!mount.offsets().is_empty()).then_some(())) },
    )
    .await
    .unwrap();

    assert_eq!(proxy.call_as::<String>("park", Value::Null).await.unwrap(), "Parking mount");
    retry_until(
        Duration::from_secs(2),
        Duration::from_millis(5),
        "parked",
        || async {
            let status = proxy.mount_info(true).await?.status;
            ObsResult::Ok((status == MountStatus::Parked).then_some(()))
        },
    )
    .await
    .unwrap();

    // Errors keep their category across the wire
    let err = MountControl::offset(&proxy, Compass::N, 2.0).await.unwrap_err();
    assert!(matches!(err, ObsError::HardwareStatus(_)));
    let err = proxy
        .call("offset", json!({"direction": "up", "distance": 2.0}))
        .await
        .unwrap_err();
    assert!(matches!(err, ObsError::InvalidArgument(_)));
    let err = proxy.call("open_dome", Value::Null).await.unwrap_err();
    match err {
        ObsError::InvalidArgument(msg) => assert!(msg.contains("Unknown method 'open_dome'")),
        other => panic!("unexpected error {:?}", other),
    }

    assert_eq!(proxy.shutdown().await.unwrap(), "Shutting down");
    worker.await.unwrap();
    server.await.unwrap().unwrap();

    let err = proxy.ping().await.unwrap_err();
    assert!(matches!(err, ObsError::Rpc(_)));
}

#[tokio::test]
async fn test_power_parameters() {
    let relay = Arc::new(MockRelay::new(false));
    let (power, _worker) = PowerDaemon::start(
        vec![("heaters".to_string(), Arc::clone(&relay) as Arc<dyn Relay>)],
        Duration::from_millis(50),
        LoopTiming::fast(),
    );
    let (proxy, _server) = start_server(power).await;

    let ack: String = proxy
        .call_as("on", json!({"outlets": ["heaters"]}))
        .await
        .unwrap();
    assert_eq!(ack, "Turning on outlet heaters");
    retry_until(
        Duration::from_secs(2),
        Duration::from_millis(5),
        "heaters on",
        || async { ObsResult::Ok(relay.get().then_some(())) },
    )
    .await
    .unwrap();

    let err = proxy.call("off", json!({"outlets": ["dome"]})).await.unwrap_err();
    assert!(matches!(err, ObsError::InvalidArgument(_)));
    let err = proxy.call("off", Value::Null).await.unwrap_err();
    assert_eq!(err.message(), "Missing parameter 'outlets'");
    let err = proxy.call("off", json!([1])).await.unwrap_err();
    assert!(matches!(err, ObsError::InvalidArgument(_)));
    proxy.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_queue_drives_remote_daemons() {
    let dir = tempfile::tempdir().unwrap();
    let timing = LoopTiming::fast();
    let filters: Vec<String> = ["L", "R"].iter().map(|f| f.to_string()).collect();

    let wheel = Arc::new(MockFilterWheel::new(2)) as Arc<dyn FilterWheel>;
    let (filt, _) = FiltDaemon::start(vec![FilterUnit::new(1, filters.clone(), wheel)], timing);
    let camera = Arc::new(MockCamera::with_timing(Duration::from_millis(10), 0.001));
    let (cam, _) = CamDaemon::start(
        vec![CameraSlot::new(1, Arc::clone(&camera) as Arc<dyn CameraUnit>)],
        timing,
    );
    let (mnt, _) = MntDaemon::start(Arc::new(MockMount::new()) as Arc<dyn MountUnit>, timing);

    let filt_handle = filt.clone();
    let (filt_proxy, _) = start_server(filt).await;
    let (cam_proxy, _) = start_server(cam).await;
    let (mnt_proxy, _) = start_server(mnt).await;

    let deps = ExqDependencies {
        filt: Arc::new(filt_proxy) as Arc<dyn FilterControl>,
        cam: Arc::new(cam_proxy) as Arc<dyn CameraControl>,
        mnt: Arc::new(mnt_proxy) as Arc<dyn MountControl>,
    };
    let settings = ExqSettings {
        ut_filters: [(1, filters)].into_iter().collect(),
        dithering: false,
        dither_pattern: vec![(Compass::N, 1.0)],
        stage_timeout: Duration::from_secs(5),
        dependency_grace: Duration::from_millis(200),
        queue_file: dir.path().join("exposure_queue"),
        set_number_file: dir.path().join("set_number"),
    };
    let (exq, _) = ExqDaemon::start(settings, deps, timing).unwrap();
    let (exq_proxy, _) = start_server(exq).await;

    let ack: String = exq_proxy
        .call_as("add", json!({"uts": [1], "exptime": 1.0, "nexp": 2, "filt": "R"}))
        .await
        .unwrap();
    assert!(ack.starts_with("Added 2x 1s R exposures"));
    exq_proxy.call("resume", Value::Null).await.unwrap();

    retry_until(
        Duration::from_secs(5),
        Duration::from_millis(10),
        "queue drained",
        || async {
            let snapshot = exq_proxy.get_info::<ExqInfo>(true).await?;
            ObsResult::Ok(
                (snapshot.info.queue_length == 0 && !snapshot.info.exposing).then_some(()),
            )
        },
    )
    .await
    .unwrap();
    assert_eq!(camera.frames(), 2);
    let filt_info = filt_handle.filter_info(true).await.unwrap();
    assert_eq!(filt_info[&1].current_filter.as_deref(), Some("R"));
}

#[tokio::test]
async fn test_proxy_times_out_on_silent_server() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let _silent = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });

    let proxy = DaemonProxy::new("cam", addr, Duration::from_millis(100));
    let err = proxy.is_exposing().await.unwrap_err();
    assert!(matches!(err, ObsError::Timeout(_)));
}
