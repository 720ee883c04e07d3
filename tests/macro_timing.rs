mod common;

use common::{connect, rig};
use nxpad::controller::buttons::{Button, ButtonMask, ControllerKind};
use nxpad::supervisor::SupervisorSettings;
use std::time::Duration;
use tokio::time::Instant;

const DPAD_MACRO: &str = "DPAD_UP 6s\nDPAD_DOWN 11s\nDPAD_UP 5.6s";
const TICK: Duration = Duration::from_millis(15);

/// A stretch of consecutive reports with buttons held
#[derive(Debug)]
struct Run {
    start: Instant,
    /// First neutral report after the run
    end: Instant,
    first_down: Option<Instant>,
    /// Neutral reports between this run and the next one
    neutral_after: usize,
}

fn within_tick(actual: Duration, expected: Duration) -> bool {
    let diff = if actual > expected {
        actual - expected
    } else {
        expected - actual
    };
    diff <= TICK
}

fn split_runs(reports: &[(Instant, [u8; 3])]) -> Vec<Run> {
    let down = ButtonMask::NONE.with(Button::DpadDown).to_bytes();
    let mut runs: Vec<Run> = Vec::new();
    let mut current: Option<Run> = None;

    for &(at, buttons) in reports {
        let active = buttons != [0, 0, 0];
        if let Some(run) = current.as_mut() {
            if active {
                if buttons == down && run.first_down.is_none() {
                    run.first_down = Some(at);
                }
                continue;
            }
            run.end = at;
            run.neutral_after = 1;
            runs.extend(current.take());
        } else if active {
            current = Some(Run {
                start: at,
                end: at,
                first_down: None,
                neutral_after: 0,
            });
        } else if let Some(last) = runs.last_mut() {
            last.neutral_after += 1;
        }
    }
    runs
}

#[tokio::test(start_paused = true)]
async fn back_to_back_macros_keep_cooldown_and_neutral_gap() {
    let mut rig = rig("dpad-macro", SupervisorSettings::default());
    let (index, mut console) = connect(&mut rig, ControllerKind::ProController).await;
    console.drain_frames();

    let collector = tokio::spawn(async move {
        let mut reports = Vec::new();
        while let Some(report) = console.next_report(Duration::from_secs(60)).await {
            let mut buttons = [0u8; 3];
            buttons.copy_from_slice(&report[4..7]);
            reports.push((Instant::now(), buttons));
        }
        reports
    });

    let first = rig.context.submit_macro(index, DPAD_MACRO).await.unwrap();
    let second = rig.context.submit_macro(index, DPAD_MACRO).await.unwrap();
    assert_ne!(first, second);

    let manager = rig.context.manager().await.unwrap();
    assert!(manager
        .wait_for_macro(index, second, Duration::from_secs(120))
        .await
        .unwrap());
    let snapshot = manager.session_state(index).unwrap().unwrap();
    assert_eq!(snapshot.finished_macros, vec![first, second]);

    // let the trailing neutral reports through before closing the link
    tokio::time::sleep(Duration::from_millis(500)).await;
    rig.context.shutdown().await;
    let reports = collector.await.unwrap();

    let runs = split_runs(&reports);
    assert_eq!(runs.len(), 2, "{:?}", runs);

    for run in &runs {
        let active = run.end - run.start;
        assert!(
            within_tick(active, Duration::from_millis(22_600)),
            "run lasted {:?}",
            active
        );
        let first_down = run.first_down.expect("run never pressed DPAD_DOWN");
        assert!(within_tick(first_down - run.start, Duration::from_secs(6)));
    }

    let gap = runs[1].start - runs[0].end;
    assert!(gap >= Duration::from_millis(100), "cooldown was {:?}", gap);
    assert!(
        runs[0].neutral_after >= 10,
        "only {} neutral reports between runs",
        runs[0].neutral_after
    );
}

#[tokio::test(start_paused = true)]
async fn stopped_macro_releases_and_next_one_runs() {
    let mut rig = rig("stop-macro", SupervisorSettings::default());
    let (index, _console) = connect(&mut rig, ControllerKind::ProController).await;

    let long = rig.context.submit_macro(index, "A 30s").await.unwrap();
    let short = rig.context.submit_macro(index, "B 0.2s").await.unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    rig.context.stop_macro(index, long).await.unwrap();

    let manager = rig.context.manager().await.unwrap();
    assert!(manager
        .wait_for_macro(index, short, Duration::from_secs(5))
        .await
        .unwrap());
    let snapshot = manager.session_state(index).unwrap().unwrap();
    assert_eq!(snapshot.finished_macros, vec![long, short]);
}
