//! Tests for firmware::smoothie::driver against the simulated controller

use motionkit_communication::{
    ControlLine, Mount, MoveOptions, SimulatedControlLines, SimulatedTransport, SmoothieDriver,
};
use motionkit_core::{Axis, AxisPosition, AxisSet, ControllerError, Error};
use motionkit_settings::RobotConfig;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

fn test_config() -> RobotConfig {
    let mut config = RobotConfig::default();
    config.timing.halt_pulse_ms = 1;
    config.timing.stabilize_ms = 1;
    config
}

fn driver() -> (SmoothieDriver, SimulatedTransport, SimulatedControlLines) {
    let sim = SimulatedTransport::new();
    let lines = SimulatedControlLines::new();
    let driver = SmoothieDriver::new(
        Box::new(sim.clone()),
        Arc::new(lines.clone()),
        test_config(),
    );
    (driver, sim, lines)
}

fn axes(letters: &str) -> AxisSet {
    Axis::parse_set(letters).unwrap()
}

fn target(pairs: &[(Axis, f64)]) -> BTreeMap<Axis, f64> {
    pairs.iter().copied().collect()
}

fn index_of(commands: &[String], needle: &str) -> usize {
    commands
        .iter()
        .position(|c| c.contains(needle))
        .unwrap_or_else(|| panic!("`{}` not sent; sent: {:#?}", needle, commands))
}

async fn homed_driver() -> (SmoothieDriver, SimulatedTransport, SimulatedControlLines) {
    let (mut driver, sim, lines) = driver();
    driver.home_all().await.unwrap();
    sim.clear_sent();
    (driver, sim, lines)
}

#[tokio::test]
async fn test_home_y_homes_dependencies_first() {
    let (mut driver, sim, _) = driver();
    driver.home(&axes("Y"), &AxisSet::new()).await.unwrap();

    let commands = sim.sent_commands();
    let zabc = index_of(&commands, "G28.2 ABCZ");
    let back_off = index_of(&commands, "G91 G0 Y-20 G0 Y10 G90");
    let x = index_of(&commands, "G28.2 X");
    let y = index_of(&commands, "G28.2 Y");
    assert!(zabc < back_off);
    assert!(back_off < x);
    assert!(x < y);

    for axis in Axis::ALL {
        assert!(driver.homing_status().is_homed(axis));
    }
}

#[tokio::test]
async fn test_home_sets_homed_position() {
    let (mut driver, _, _) = driver();
    let position = driver.home_all().await.unwrap();
    let expected = AxisPosition::with_axes(418.0, 353.0, 218.0, 218.0, 19.0, 19.0);
    assert_eq!(position, expected);
    assert_eq!(driver.position(), &expected);
}

#[tokio::test]
async fn test_home_plunger_only() {
    let (mut driver, sim, _) = driver();
    driver.home(&axes("B"), &AxisSet::new()).await.unwrap();
    let commands = sim.sent_commands();
    index_of(&commands, "G28.2 B");
    assert!(!commands.iter().any(|c| c.contains("G28.2 X")));
    assert!(!driver.homing_status().is_homed(Axis::X));
}

#[tokio::test]
async fn test_set_current_settles_before_next_command() {
    let (mut driver, sim, _) = driver();
    driver
        .set_current(&target(&[(Axis::X, 1.0)]), true)
        .await
        .unwrap();
    driver.update_position().await.unwrap();

    let sent = sim.sent_lines();
    let current = sent
        .iter()
        .find(|s| s.line.starts_with("M907"))
        .expect("current command sent");
    let query = sent
        .iter()
        .find(|s| s.line == "M114.2")
        .expect("position query sent");
    assert!(current.line.contains("X1"));
    assert!(current.line.ends_with("G4 P0.05"));
    assert!(query.at.duration_since(current.at) >= Duration::from_millis(50));
}

#[tokio::test]
async fn test_move_within_tolerance_sends_nothing() {
    let (mut driver, sim, _) = driver();
    let x = driver.position().get(Axis::X);
    let position = driver
        .move_to(&target(&[(Axis::X, x + 0.001)]), MoveOptions::default())
        .await
        .unwrap();
    assert_eq!(position.get(Axis::X), x);
    assert!(sim.sent_commands().is_empty());
}

#[tokio::test]
async fn test_move_homes_flagged_axes_first() {
    let (mut driver, sim, _) = driver();
    driver
        .move_to(&target(&[(Axis::Z, 100.0)]), MoveOptions::default())
        .await
        .unwrap();
    let commands = sim.sent_commands();
    assert!(index_of(&commands, "G28.2 Z") < index_of(&commands, "G0 Z100"));
    assert_eq!(driver.position().get(Axis::Z), 100.0);
}

#[tokio::test]
async fn test_move_updates_position_and_uses_speed() {
    let (mut driver, sim, _) = homed_driver().await;
    driver
        .move_to(
            &target(&[(Axis::X, 100.0), (Axis::Y, 50.123_4)]),
            MoveOptions::default().with_speed(10.0),
        )
        .await
        .unwrap();

    let commands = sim.sent_commands();
    let line = &commands[index_of(&commands, "G0 X100 Y50.123")];
    assert!(line.starts_with("G0F600"));
    assert!(line.ends_with("G0F24000"));
    assert_eq!(driver.position().get(Axis::X), 100.0);
    assert_eq!(driver.position().get(Axis::Y), 50.1234);
}

#[tokio::test]
async fn test_plunger_backlash() {
    let (mut driver, sim, _) = homed_driver().await;
    driver
        .move_to(&target(&[(Axis::B, 25.0)]), MoveOptions::default())
        .await
        .unwrap();
    let commands = sim.sent_commands();
    index_of(&commands, "G0 B25.3 G0 B25");
    assert_eq!(driver.position().get(Axis::B), 25.0);

    sim.clear_sent();
    driver
        .move_to(&target(&[(Axis::B, 10.0)]), MoveOptions::default())
        .await
        .unwrap();
    let commands = sim.sent_commands();
    let line = &commands[index_of(&commands, "G0 B10")];
    assert_eq!(line.matches("G0 ").count(), 1);
}

#[tokio::test]
async fn test_pop_current_without_push_is_noop() {
    let (mut driver, sim, _) = driver();
    let before = driver.current_state().clone();
    driver.pop_current().await.unwrap();
    assert_eq!(driver.current_state(), &before);
    assert!(sim.sent_commands().is_empty());
}

#[tokio::test]
async fn test_push_pop_current_restores() {
    let (mut driver, _, _) = driver();
    let before = driver.current_state().currents();
    driver.push_current();
    driver
        .set_current(&target(&[(Axis::Z, 0.8)]), true)
        .await
        .unwrap();
    assert_eq!(driver.current_state().currents()[&Axis::Z], 0.8);
    driver.pop_current().await.unwrap();
    assert_eq!(driver.current_state().currents(), before);
}

#[tokio::test]
async fn test_with_axis_max_speed_restores_on_error() {
    let (mut driver, sim, _) = driver();
    let before = driver.max_speeds().clone();
    sim.script_reply("M119", "error: switch read failed");
    let result = driver
        .with_axis_max_speed(target(&[(Axis::X, 5.0)]), |driver| {
            Box::pin(async move { driver.switch_state().await })
        })
        .await;
    assert!(result.is_err());
    assert_eq!(driver.max_speeds(), &before);
    let commands = sim.sent_commands();
    assert!(index_of(&commands, "M203.1 X5") < index_of(&commands, "M203.1 A125"));
}

#[tokio::test]
async fn test_nested_max_speed_scopes_restore_outer_values() {
    let (mut driver, _, _) = driver();
    let before = driver.max_speeds().clone();
    driver
        .with_axis_max_speed(target(&[(Axis::Y, 20.0)]), |driver| {
            Box::pin(async move {
                driver
                    .with_axis_max_speed(target(&[(Axis::Y, 1.0)]), |driver| {
                        Box::pin(async move {
                            assert_eq!(driver.max_speeds()[&Axis::Y], 1.0);
                            Ok(())
                        })
                    })
                    .await?;
                assert_eq!(driver.max_speeds()[&Axis::Y], 20.0);
                Ok(())
            })
        })
        .await
        .unwrap();
    assert_eq!(driver.max_speeds(), &before);
}

#[tokio::test]
async fn test_nested_speed_and_current_scopes_restore() {
    let (mut driver, _, _) = driver();
    let speed = driver.combined_speed();
    let currents = driver.current_state().clone();
    driver
        .with_current(|driver| {
            Box::pin(async move {
                driver.set_current(&target(&[(Axis::Z, 0.8)]), true).await?;
                driver
                    .with_speed(5.0, |driver| {
                        Box::pin(async move {
                            driver
                                .with_current(|driver| {
                                    Box::pin(async move {
                                        driver.set_current(&target(&[(Axis::Z, 1.2)]), true).await
                                    })
                                })
                                .await?;
                            assert_eq!(driver.current_state().currents()[&Axis::Z], 0.8);
                            driver.with_speed(1.0, |_| Box::pin(async { Ok(()) })).await?;
                            assert_eq!(driver.combined_speed(), 5.0);
                            Ok(())
                        })
                    })
                    .await?;
                assert_eq!(driver.combined_speed(), speed);
                Ok(())
            })
        })
        .await
        .unwrap();
    assert_eq!(driver.combined_speed(), speed);
    assert_eq!(driver.current_state(), &currents);
}

#[tokio::test]
async fn test_scoped_helpers_leave_push_slot_alone() {
    let (mut driver, _, _) = driver();
    let before = driver.max_speeds().clone();
    driver.push_axis_max_speed();
    driver
        .set_axis_max_speed(&target(&[(Axis::X, 30.0)]))
        .await
        .unwrap();
    driver
        .with_axis_max_speed(target(&[(Axis::X, 2.0)]), |_| Box::pin(async { Ok(()) }))
        .await
        .unwrap();
    assert_eq!(driver.max_speeds()[&Axis::X], 30.0);
    driver.pop_axis_max_speed().await.unwrap();
    assert_eq!(driver.max_speeds(), &before);
}

#[tokio::test]
async fn test_unstick_pressed_axis_restores_speeds_and_currents() {
    let (mut driver, sim, _) = homed_driver().await;
    let speeds = driver.max_speeds().clone();
    let currents = driver.current_state().currents();
    sim.set_switch(Axis::Y, true);

    driver.unstick_axes(&axes("Y"), None, None).await.unwrap();

    assert_eq!(driver.max_speeds(), &speeds);
    assert_eq!(driver.current_state().currents(), currents);
    let commands = sim.sent_commands();
    assert!(index_of(&commands, "M119") < index_of(&commands, "G28.2 Y"));
}

#[tokio::test]
async fn test_alarm_on_move_resets_and_homes() {
    let (mut driver, sim, _) = homed_driver().await;
    sim.script_reply("G0 X100", "ALARM: Hard limit +X");

    let err = driver
        .move_to(&target(&[(Axis::X, 100.0)]), MoveOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Controller(ControllerError::Alarm { ref response, .. }) if response.contains("Hard limit")
    ));

    let commands = sim.sent_commands();
    let moved = index_of(&commands, "G0 X100");
    let reset = index_of(&commands, "M999");
    let homed = index_of(&commands, "G28.2 X");
    assert!(moved < reset);
    assert!(reset < homed);
    assert_eq!(driver.position().get(Axis::X), 418.0);
}

#[tokio::test]
async fn test_error_on_query_does_not_home() {
    let (mut driver, sim, _) = homed_driver().await;
    sim.script_reply("M119", "error: bad switch");
    assert!(driver.switch_state().await.is_err());
    let commands = sim.sent_commands();
    index_of(&commands, "M999");
    assert!(!commands.iter().any(|c| c.contains("G28.2")));
}

#[tokio::test]
async fn test_post_halt_responses_are_ignored() {
    let (mut driver, sim, _) = homed_driver().await;
    sim.script_reply("G0 X100", "ALARM: After HALT you should HOME");
    driver
        .move_to(&target(&[(Axis::X, 100.0)]), MoveOptions::default())
        .await
        .unwrap();
    assert!(!sim.sent_commands().iter().any(|c| c == "M999"));
}

#[tokio::test]
async fn test_hard_halt_alarm_is_reported_as_halt() {
    let (mut driver, sim, lines) = homed_driver().await;
    driver.hard_halt().await.unwrap();
    assert_eq!(
        lines.events(),
        vec![(ControlLine::Halt, true), (ControlLine::Halt, false)]
    );

    sim.script_reply("G0 X100", "ALARM: Emergency stop");
    let err = driver
        .move_to(&target(&[(Axis::X, 100.0)]), MoveOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Controller(ControllerError::Halted { .. })
    ));
    assert!(!sim.sent_commands().iter().any(|c| c == "M999"));

    // halt is consumed by the first alarm
    sim.script_reply("G0 X100", "ALARM: Hard limit +X");
    let err = driver
        .move_to(&target(&[(Axis::X, 100.0)]), MoveOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Controller(ControllerError::Alarm { .. })
    ));
}

#[tokio::test]
async fn test_pause_blocks_motion_until_resume() {
    let (mut driver, sim, _) = homed_driver().await;
    driver.pause();
    let run = driver.run_control();
    let resumer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        run.resume();
    });

    let started = std::time::Instant::now();
    driver
        .move_to(&target(&[(Axis::X, 100.0)]), MoveOptions::default())
        .await
        .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(100));
    resumer.await.unwrap();
    index_of(&sim.sent_commands(), "G0 X100");
}

#[tokio::test]
async fn test_probe_failure_homes_and_reports_tip_probe() {
    let (mut driver, sim, _) = homed_driver().await;
    sim.script_reply("G38.2", "ALARM: Probe fail");
    let err = driver.probe_axis("Z", -10.0).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Controller(ControllerError::TipProbe { ref command, .. }) if command == "G38.2 F420 Z-10"
    ));
    let commands = sim.sent_commands();
    assert!(index_of(&commands, "M999") < index_of(&commands, "G28.2 Z"));
}

#[tokio::test]
async fn test_probe_success_reads_position() {
    let (mut driver, sim, _) = homed_driver().await;
    sim.set_position(AxisPosition::with_axes(418.0, 353.0, 201.5, 218.0, 19.0, 19.0));
    let position = driver.probe_axis("z", -20.0).await.unwrap();
    assert_eq!(position.get(Axis::Z), 201.5);
    assert!(driver.probe_axis("Q", 1.0).await.is_err());
}

#[tokio::test]
async fn test_pipette_memory_read_and_write() {
    let (mut driver, sim, _) = driver();
    sim.set_pipette_memory("id:L", b"P10SV1318010101\x00\xff\xff");

    let id = driver.read_pipette_id(Mount::Left).await.unwrap();
    assert_eq!(id.as_deref(), Some("P10SV1318010101"));
    let commands = sim.sent_commands();
    assert!(index_of(&commands, "M18 ABCZ") < index_of(&commands, "M369 L"));

    assert_eq!(driver.read_pipette_id(Mount::Right).await.unwrap(), None);

    driver
        .write_pipette_model(Mount::Right, "p300_single")
        .await
        .unwrap();
    index_of(&sim.sent_commands(), "M372 R 703330305f73696e676c65");
    let model = driver.read_pipette_model(Mount::Right).await.unwrap();
    assert_eq!(model.as_deref(), Some("p300_single_v1"));
}

#[tokio::test]
async fn test_setup_applies_configuration() {
    let (mut driver, sim, _) = driver();
    driver.setup().await.unwrap();

    let commands = sim.sent_commands();
    assert_eq!(commands[0], "");
    let reset = index_of(&commands, "M999");
    let steps = index_of(&commands, "M92 A400 B768 C768 X80 Y80 Z400");
    let absolute = index_of(&commands, "G90");
    assert!(reset < steps && steps < absolute);
    index_of(&commands, "M203.1 A125 B40 C40 X600 Y400 Z125");
    index_of(&commands, "G0F24000");
    index_of(&commands, "M204 S10000 A15 B2 C2 X3 Y2 Z15");
}

#[tokio::test]
async fn test_setup_pulses_reset_when_silent() {
    let mut config = test_config();
    config.connection.boot_timeout_ms = 20;
    let sim = SimulatedTransport::new();
    let lines = SimulatedControlLines::new();
    let mut driver = SmoothieDriver::new(Box::new(sim.clone()), Arc::new(lines.clone()), config);
    sim.script_timeout("");

    driver.setup().await.unwrap();
    assert_eq!(
        lines.events(),
        vec![
            (ControlLine::Reset, true),
            (ControlLine::Isp, false),
            (ControlLine::Reset, false),
        ]
    );
}

#[tokio::test]
async fn test_fw_version_and_switches() {
    let (mut driver, sim, _) = driver();
    assert_eq!(driver.get_fw_version().await.unwrap(), "edge-1a2b3c4");
    sim.set_switch(Axis::A, true);
    let switches = driver.switch_state().await.unwrap();
    assert!(switches.is_pressed(Axis::A));
    assert!(!switches.is_pressed(Axis::Z));
}

#[tokio::test]
async fn test_unstick_homes_pressed_and_backs_off_others() {
    let (mut driver, sim, _) = homed_driver().await;
    sim.set_switch(Axis::Z, true);
    let currents_before = driver.current_state().active_table().clone();

    driver
        .unstick_axes(&axes("ZA"), None, None)
        .await
        .unwrap();

    let commands = sim.sent_commands();
    let slow = index_of(&commands, "M203.1 A1 Z1");
    let backed = index_of(&commands, "G0 A217");
    let homed = index_of(&commands, "G28.2 Z");
    assert!(slow < backed && backed < homed);
    assert_eq!(driver.current_state().active_table(), &currents_before);
    assert_eq!(driver.position().get(Axis::Z), 218.0);
}

#[tokio::test]
async fn test_disengage_axis() {
    let (mut driver, sim, _) = homed_driver().await;
    assert!(driver.engaged_axes().contains(&Axis::B));
    driver.disengage_axis(&axes("BC")).await.unwrap();
    assert_eq!(sim.sent_commands(), vec!["M18 BC"]);
    assert!(!driver.engaged_axes().contains(&Axis::B));
}
