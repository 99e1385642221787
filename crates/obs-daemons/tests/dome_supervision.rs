//! Dome daemon end-to-end against the simulated hardware.

use obs_core::adapter::AdapterSlot;
use obs_core::capabilities::{DomeUnit, Heartbeat, QuickCloseButton, Relay, SideState};
use obs_core::retry::retry_until;
use obs_core::site::{ConditionsSource, FileStatus, Mode};
use obs_core::{LoopTiming, ObsError, ObsResult};
use obs_daemons::dome::{
    DomeDaemon, DomeHardware, DomeInfo, DomeSettings, DomeState, Lockdown, MoveSide,
};
use obs_driver_mock::{MockButton, MockConditions, MockDome, MockHeartbeat, MockRelay};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct Rig {
    daemon: DomeDaemon,
    dome: Arc<MockDome>,
    conditions: Arc<MockConditions>,
    button: Arc<MockButton>,
    dehumidifier: Arc<MockRelay>,
    site: FileStatus,
    dir: TempDir,
}

fn test_settings() -> DomeSettings {
    DomeSettings {
        alarm_settle: Duration::from_millis(10),
        move_timeout: Duration::from_secs(5),
        ..DomeSettings::default()
    }
}

fn rig(travel: Duration) -> Rig {
    rig_with(travel, test_settings())
}

fn rig_with(travel: Duration, settings: DomeSettings) -> Rig {
    let dir = tempfile::tempdir().unwrap();
    let site = FileStatus::new(
        dir.path().join("status_flags.json"),
        dir.path().join("EMERGENCY-SHUTDOWN"),
    );
    site.set_mode(Mode::Robotic).unwrap();

    let dome = Arc::new(MockDome::builder().travel_time(travel).build());
    let conditions = Arc::new(MockConditions::new());
    let button = Arc::new(MockButton::new());
    let dehumidifier = Arc::new(MockRelay::new(false));
    let hardware = DomeHardware {
        dome: AdapterSlot::fixed("dome", Arc::clone(&dome) as Arc<dyn DomeUnit>),
        heartbeat: AdapterSlot::fixed(
            "heartbeat",
            Arc::new(MockHeartbeat::new()) as Arc<dyn Heartbeat>,
        ),
        dehumidifier: Some(AdapterSlot::fixed(
            "dehumidifier",
            Arc::clone(&dehumidifier) as Arc<dyn Relay>,
        )),
        button: Some(AdapterSlot::fixed(
            "button",
            Arc::clone(&button) as Arc<dyn QuickCloseButton>,
        )),
        conditions: Arc::clone(&conditions) as Arc<dyn ConditionsSource>,
        site: site.clone(),
    };
    let (daemon, _handle) = DomeDaemon::start(hardware, settings, LoopTiming::fast());
    Rig {
        daemon,
        dome,
        conditions,
        button,
        dehumidifier,
        site,
        dir,
    }
}

/// Let the worker run two more full ticks.
async fn two_ticks(daemon: &DomeDaemon) {
    daemon.get_info(true).await.unwrap();
    daemon.get_info(true).await.unwrap();
}

async fn wait_until(what: &str, f: impl Fn() -> bool) {
    retry_until(
        Duration::from_secs(5),
        Duration::from_millis(5),
        what,
        || async { ObsResult::Ok(f().then_some(())) },
    )
    .await
    .unwrap();
}

async fn wait_for(daemon: &DomeDaemon, what: &str, f: impl Fn(&DomeInfo) -> bool) {
    retry_until(
        Duration::from_secs(5),
        Duration::from_millis(5),
        what,
        || async {
            let snapshot = daemon.get_info(true).await?;
            ObsResult::Ok(f(&snapshot.info).then_some(()))
        },
    )
    .await
    .unwrap();
}

fn settled(info: &DomeInfo, state: DomeState) -> bool {
    info.dome == Some(state) && info.motion.is_none()
}

#[tokio::test]
async fn test_open_then_close() {
    let rig = rig(Duration::from_millis(50));
    let daemon = &rig.daemon;

    let ack = daemon.open_dome(MoveSide::Both, 1.0).await.unwrap();
    assert_eq!(ack, "Opening dome (both 1)");
    wait_for(daemon, "dome open", |i| settled(i, DomeState::Open)).await;
    let info = daemon.get_info(false).await.unwrap();
    assert_eq!(info.info.a_side, Some(SideState::FullOpen));
    assert_eq!(info.info.b_side, Some(SideState::FullOpen));
    assert!(info.info.last_move_time.is_some());
    // Alarm sounds once per side while the alarm is enabled
    assert_eq!(rig.dome.alarm_count(), 2);

    assert_eq!(
        daemon.open_dome(MoveSide::Both, 1.0).await.unwrap(),
        "Dome is already open"
    );

    daemon.close_dome(MoveSide::Both, 1.0).await.unwrap();
    wait_for(daemon, "dome closed", |i| settled(i, DomeState::Closed)).await;
    daemon.core().shutdown();
}

#[tokio::test]
async fn test_partial_open_of_one_side() {
    let rig = rig(Duration::from_millis(100));
    let daemon = &rig.daemon;

    let ack = daemon.open_dome(MoveSide::ASide, 0.5).await.unwrap();
    assert_eq!(ack, "Opening dome (a_side 0.5)");
    wait_for(daemon, "a side part open", |i| {
        i.motion.is_none() && i.a_side == Some(SideState::PartOpen)
    })
    .await;
    let (a, b) = rig.dome.positions();
    assert!((a - 0.5).abs() < 0.05);
    assert_eq!(b, 0.0);

    let err = daemon.open_dome(MoveSide::Both, 1.5).await.unwrap_err();
    assert!(matches!(err, ObsError::InvalidArgument(_)));
    daemon.core().shutdown();
}

#[tokio::test]
async fn test_halt_stops_motion() {
    let rig = rig(Duration::from_secs(3));
    let daemon = &rig.daemon;

    daemon.open_dome(MoveSide::Both, 1.0).await.unwrap();
    wait_for(daemon, "dome moving", |i| i.a_side == Some(SideState::Opening)).await;

    assert_eq!(daemon.halt_dome().unwrap(), "Halting dome");
    wait_for(daemon, "motion stopped", |i| {
        i.motion.is_none() && i.a_side == Some(SideState::PartOpen)
    })
    .await;
    let (a, b) = rig.dome.positions();
    assert!(a > 0.0 && a < 1.0);
    assert_eq!(b, 0.0);
    daemon.core().shutdown();
}

#[tokio::test]
async fn test_bad_conditions_autoclose_and_refuse_open() {
    let rig = rig(Duration::from_millis(50));
    let daemon = &rig.daemon;

    daemon.open_dome(MoveSide::Both, 1.0).await.unwrap();
    wait_for(daemon, "dome open", |i| settled(i, DomeState::Open)).await;

    rig.conditions.set_bad(&["rain"]);
    wait_for(daemon, "lockdown", |i| i.lockdown == Lockdown::Active).await;
    wait_for(daemon, "autoclosed", |i| {
        settled(i, DomeState::Closed) && !i.autoclosing
    })
    .await;

    let info = daemon.get_info(false).await.unwrap();
    assert_eq!(info.info.lockdown_reasons, vec!["conditions bad (rain)".to_string()]);
    let err = daemon.open_dome(MoveSide::Both, 1.0).await.unwrap_err();
    assert_eq!(err.message(), "Dome is in lockdown");
    // Closing is always allowed
    assert_eq!(
        daemon.close_dome(MoveSide::Both, 1.0).await.unwrap(),
        "Dome is already closed"
    );

    rig.conditions.set_bad(&[]);
    wait_for(daemon, "lockdown lifted", |i| i.lockdown == Lockdown::Clear).await;
    daemon.open_dome(MoveSide::Both, 1.0).await.unwrap();
    daemon.core().shutdown();
}

#[tokio::test]
async fn test_quick_close_button_triggers_lockdown() {
    let rig = rig(Duration::from_millis(50));
    let daemon = &rig.daemon;

    daemon.open_dome(MoveSide::Both, 1.0).await.unwrap();
    wait_for(daemon, "dome open", |i| settled(i, DomeState::Open)).await;

    rig.button.set_pressed(true);
    wait_for(daemon, "autoclosed", |i| {
        i.lockdown == Lockdown::Active && settled(i, DomeState::Closed)
    })
    .await;
    daemon.core().shutdown();
}

#[tokio::test]
async fn test_autoclose_disabled_ignores_lockdown_until_timeout() {
    let rig = rig(Duration::from_millis(50));
    let daemon = &rig.daemon;

    // Autoclose cannot be disabled in robotic mode
    let err = daemon.set_autoclose(false, None).await.unwrap_err();
    assert!(matches!(err, ObsError::HardwareStatus(_)));

    rig.site.set_mode(Mode::Manual).unwrap();
    wait_for(daemon, "manual mode", |i| i.mode == Mode::Manual).await;
    daemon.open_dome(MoveSide::Both, 1.0).await.unwrap();
    wait_for(daemon, "dome open", |i| settled(i, DomeState::Open)).await;

    let ack = daemon.set_autoclose(false, Some(0.3)).await.unwrap();
    assert_eq!(ack, "Disabling autoclose for 0.0 minutes");
    wait_for(daemon, "autoclose off", |i| !i.autoclose_enabled).await;

    rig.conditions.set_bad(&["wind"]);
    wait_for(daemon, "lockdown ignored", |i| i.lockdown == Lockdown::Ignored).await;
    let info = daemon.get_info(true).await.unwrap();
    assert_eq!(info.info.dome, Some(DomeState::Open));

    // Once the timeout lapses autoclose comes back on and the dome closes
    wait_for(daemon, "autoclose back on", |i| i.autoclose_enabled).await;
    wait_for(daemon, "autoclosed", |i| settled(i, DomeState::Closed)).await;
    daemon.core().shutdown();
}

#[tokio::test]
async fn test_engineering_mode_disables_automation() {
    let rig = rig(Duration::from_millis(50));
    let daemon = &rig.daemon;

    rig.site.set_mode(Mode::Engineering).unwrap();
    wait_for(daemon, "engineering mode", |i| {
        i.mode == Mode::Engineering && !i.autoclose_enabled && !i.alarm_enabled
    })
    .await;

    let err = daemon.set_alarm(true).await.unwrap_err();
    assert_eq!(err.message(), "Cannot enable alarm in engineering mode");

    rig.conditions.set_bad(&["rain"]);
    daemon.open_dome(MoveSide::Both, 1.0).await.unwrap();
    wait_for(daemon, "dome open", |i| settled(i, DomeState::Open)).await;
    let info = daemon.get_info(true).await.unwrap();
    assert_eq!(info.info.lockdown, Lockdown::Clear);
    // No alarm in engineering mode
    assert_eq!(rig.dome.alarm_count(), 0);
    daemon.core().shutdown();
}

#[tokio::test]
async fn test_autoclose_timeout_out_of_range_is_refused() {
    let rig = rig(Duration::from_millis(50));
    let daemon = &rig.daemon;

    rig.site.set_mode(Mode::Manual).unwrap();
    wait_for(daemon, "manual mode", |i| i.mode == Mode::Manual).await;

    let err = daemon.set_autoclose(false, Some(1e300)).await.unwrap_err();
    assert!(matches!(err, ObsError::InvalidArgument(_)));
    let err = daemon.set_autoclose(false, Some(f64::INFINITY)).await.unwrap_err();
    assert!(matches!(err, ObsError::InvalidArgument(_)));

    two_ticks(daemon).await;
    let info = daemon.get_info(false).await.unwrap();
    assert!(info.info.autoclose_enabled);
    assert!(info.info.autoclose_timeout.is_none());
    daemon.core().shutdown();
}

#[tokio::test]
async fn test_autodehum_hysteresis() {
    let rig = rig(Duration::from_millis(50));
    let daemon = &rig.daemon;
    let relay = Arc::clone(&rig.dehumidifier);

    // Closed and humid
    rig.conditions.set_weather(5.0, 10.0, 80.0);
    wait_until("dehumidifier on", || relay.get()).await;

    // Inside the band it stays on
    rig.conditions.set_weather(5.0, 10.0, 70.0);
    two_ticks(daemon).await;
    assert!(relay.get());
    // Dry again but still too cold to release
    rig.conditions.set_weather(5.0, 1.5, 60.0);
    two_ticks(daemon).await;
    assert!(relay.get());

    rig.conditions.set_weather(5.0, 5.0, 60.0);
    wait_until("dehumidifier off", || !relay.get()).await;

    // Closed and cold
    rig.conditions.set_weather(5.0, 0.0, 40.0);
    wait_until("dehumidifier on when cold", || relay.get()).await;

    // Opening the dome always turns it off
    daemon.open_dome(MoveSide::Both, 1.0).await.unwrap();
    wait_for(daemon, "dome open", |i| settled(i, DomeState::Open)).await;
    wait_until("dehumidifier off when open", || !relay.get()).await;
    two_ticks(daemon).await;
    assert!(!relay.get());
    daemon.core().shutdown();
}

#[tokio::test]
async fn test_autoshield_wind_hysteresis() {
    let settings = DomeSettings {
        windshield_permitted: true,
        ..test_settings()
    };
    let rig = rig_with(Duration::from_millis(50), settings);
    let daemon = &rig.daemon;
    wait_for(daemon, "autoshield on", |i| i.autoshield_enabled).await;

    daemon.open_dome(MoveSide::Both, 1.0).await.unwrap();
    wait_for(daemon, "dome open", |i| settled(i, DomeState::Open)).await;

    // Gusts above the upper threshold close both sides to the shield position
    rig.conditions.set_weather(45.0, 10.0, 40.0);
    wait_for(daemon, "shielding", |i| {
        i.windshield_enabled && i.shielding && i.motion.is_none()
            && i.a_side == Some(SideState::PartOpen)
            && i.b_side == Some(SideState::PartOpen)
    })
    .await;
    let (a, b) = rig.dome.positions();
    assert!((a - 0.5).abs() < 0.05);
    assert!((b - 0.5).abs() < 0.05);

    // Between the thresholds nothing changes
    rig.conditions.set_weather(38.0, 10.0, 40.0);
    two_ticks(daemon).await;
    let info = daemon.get_info(true).await.unwrap();
    assert!(info.info.windshield_enabled);
    assert!(info.info.shielding);

    // Below the lower threshold the dome reopens fully
    rig.conditions.set_weather(30.0, 10.0, 40.0);
    wait_for(daemon, "reopened", |i| {
        !i.windshield_enabled && !i.shielding && settled(i, DomeState::Open)
            && i.a_side == Some(SideState::FullOpen)
            && i.b_side == Some(SideState::FullOpen)
    })
    .await;
    daemon.core().shutdown();
}

#[tokio::test]
async fn test_emergency_marker_triggers_lockdown() {
    let rig = rig(Duration::from_millis(50));
    let daemon = &rig.daemon;

    daemon.open_dome(MoveSide::Both, 1.0).await.unwrap();
    wait_for(daemon, "dome open", |i| settled(i, DomeState::Open)).await;

    rig.site.create_shutdown_file(&["fire alarm"]).unwrap();
    wait_for(daemon, "autoclosed", |i| {
        i.lockdown == Lockdown::Active && settled(i, DomeState::Closed)
    })
    .await;
    let info = daemon.get_info(false).await.unwrap();
    assert!(info.info.emergency);
    assert_eq!(
        info.info.lockdown_reasons,
        vec!["emergency shutdown (fire alarm)".to_string()]
    );

    std::fs::remove_file(rig.dir.path().join("EMERGENCY-SHUTDOWN")).unwrap();
    wait_for(daemon, "lockdown lifted", |i| {
        i.lockdown == Lockdown::Clear && !i.emergency
    })
    .await;
    daemon.core().shutdown();
}

#[tokio::test]
async fn test_hatch_left_open_in_robotic_mode() {
    let settings = DomeSettings {
        hatch_open_delay: Duration::from_millis(300),
        ..test_settings()
    };
    let rig = rig_with(Duration::from_millis(50), settings);
    let daemon = &rig.daemon;

    rig.dome.set_hatch_open(true);
    let info = daemon.get_info(true).await.unwrap();
    assert_eq!(info.info.hatch_closed, Some(false));
    assert_eq!(info.info.lockdown, Lockdown::Clear);

    wait_for(daemon, "hatch lockdown", |i| i.lockdown == Lockdown::Active).await;
    let info = daemon.get_info(false).await.unwrap();
    assert_eq!(
        info.info.lockdown_reasons,
        vec!["hatch open in robotic mode".to_string()]
    );

    // An open hatch is expected when someone is on site
    rig.site.set_mode(Mode::Manual).unwrap();
    wait_for(daemon, "lockdown lifted", |i| {
        i.mode == Mode::Manual && i.lockdown == Lockdown::Clear
    })
    .await;
    daemon.core().shutdown();
}

#[tokio::test]
async fn test_halt_beats_open_in_the_same_tick() {
    let rig = rig(Duration::from_millis(50));
    let daemon = &rig.daemon;

    // No await between the two, so the worker sees both commands together
    daemon.open_dome(MoveSide::Both, 1.0).await.unwrap();
    daemon.halt_dome().unwrap();

    two_ticks(daemon).await;
    let info = daemon.get_info(true).await.unwrap();
    assert!(info.info.motion.is_none());
    assert_eq!(info.info.dome, Some(DomeState::Closed));
    assert_eq!(rig.dome.positions(), (0.0, 0.0));
    assert_eq!(rig.dome.alarm_count(), 0);
    daemon.core().shutdown();
}
