mod common;

use common::*;
use rayos_ischain::{
    DoneEvent, DoneKind, DoneOutcome, DoneReason, FrameState, FrameTemplate, Instance, OutputSet, PlaneBuffer,
    SchedError, StartOutcome, TriggerMode,
};
use std::time::Duration;

const I0: Instance = Instance(0);

#[tokio::test]
async fn test_frame_start_moves_configured_to_wait() {
    let rig = Rig::new(test_config());
    let chain = rig.open(I0, LINE, TriggerMode::OnDemand, 1_000);
    rig.scheduler.grp_shot(I0, &FrameTemplate::new(5, line_outputs())).unwrap();

    assert_eq!(rig.scheduler.frame_start(MID, I0).unwrap(), StartOutcome::Follower);
    assert_eq!(chain.queue().counts(), [19, 0, 1, 0]);

    match rig.scheduler.frame_start(HEAD, I0).unwrap() {
        StartOutcome::Started(view) => assert_eq!(view.fcount, 5),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(chain.queue().counts(), [19, 0, 0, 1]);
    assert!(chain.leader().frame_valid());
}

#[tokio::test]
async fn test_duplicate_frame_start_changes_nothing() {
    let rig = Rig::new(test_config());
    let chain = rig.open(I0, LINE, TriggerMode::OnDemand, 1_000);
    rig.scheduler.grp_shot(I0, &FrameTemplate::new(10, line_outputs())).unwrap();

    assert!(matches!(rig.scheduler.frame_start(HEAD, I0).unwrap(), StartOutcome::Started(_)));
    let before = chain.queue().counts();

    assert_eq!(rig.scheduler.frame_start(HEAD, I0).unwrap(), StartOutcome::Duplicate(10));
    assert_eq!(rig.scheduler.frame_start(HEAD, I0).unwrap(), StartOutcome::Duplicate(10));
    assert_eq!(chain.queue().counts(), before);

    let stats = rig.scheduler.statistics();
    assert_eq!(stats.duplicate_starts, 2);
    assert_eq!(stats.protocol_violations, 0);
}

#[tokio::test]
async fn test_frame_start_without_configured_frame_is_a_violation() {
    let rig = Rig::new(test_config());
    rig.open(I0, LINE, TriggerMode::OnDemand, 1_000);

    let err = rig.scheduler.frame_start(HEAD, I0).unwrap_err();
    assert!(matches!(err, SchedError::NoMatchingFrame { state: FrameState::Configured, .. }));
    assert_eq!(rig.scheduler.statistics().protocol_violations, 1);
    assert_eq!(rig.scheduler.registry().bug_count(), 1);
}

#[tokio::test]
async fn test_signal_order_does_not_matter() {
    let rig = Rig::new(test_config());
    let chain = rig.open(I0, LINE, TriggerMode::OnDemand, 1_000);
    let rx = rig.scheduler.subscribe();
    let mut rng = fastrand::Rng::with_seed(7);

    for fcount in 1..=40 {
        rig.scheduler.grp_shot(I0, &FrameTemplate::new(fcount, line_outputs())).unwrap();
        let view = match rig.scheduler.frame_start(HEAD, I0).unwrap() {
            StartOutcome::Started(view) => view,
            other => panic!("unexpected {:?}", other),
        };

        let mut signals = line_signals(I0, &view);
        rng.shuffle(&mut signals);
        let outcomes: Vec<DoneOutcome> = signals
            .into_iter()
            .map(|event| rig.scheduler.frame_done(event).unwrap())
            .collect();

        let retired = outcomes.iter().filter(|o| o.is_retired()).count();
        assert_eq!(retired, 1, "frame {} retired {} times", fcount, retired);
        assert!(outcomes.last().unwrap().is_retired());
        assert_eq!(chain.queue().counts(), [20, 0, 0, 0]);
    }

    let messages = drain(&rx);
    let shots: Vec<u64> = messages
        .iter()
        .filter(|m| m.kind == DoneKind::Shot)
        .map(|m| m.fcount)
        .collect();
    assert_eq!(shots, (1..=40).collect::<Vec<_>>());
    assert!(messages.iter().all(|m| m.reason == DoneReason::Success));
    assert_eq!(messages.iter().filter(|m| m.kind == DoneKind::Output(MID_OUT)).count(), 40);
    assert_eq!(rig.scheduler.statistics().retired, 40);
}

#[tokio::test]
async fn test_concurrent_signals_retire_once() {
    let rig = Rig::new(test_config());
    let chain = rig.open(I0, LINE, TriggerMode::OnDemand, 1_000);
    let rx = rig.scheduler.subscribe();

    for fcount in 1..=50 {
        rig.scheduler.grp_shot(I0, &FrameTemplate::new(fcount, line_outputs())).unwrap();
        let view = match rig.scheduler.frame_start(HEAD, I0).unwrap() {
            StartOutcome::Started(view) => view,
            other => panic!("unexpected {:?}", other),
        };

        let scheduler = &rig.scheduler;
        let retired = std::thread::scope(|s| {
            let workers: Vec<_> = line_signals(I0, &view)
                .into_iter()
                .map(|event| s.spawn(move || scheduler.frame_done(event).unwrap().is_retired()))
                .collect();
            workers.into_iter().map(|w| w.join()).filter(|r| matches!(r, Ok(true))).count()
        });
        assert_eq!(retired, 1);
        assert_eq!(chain.queue().counts(), [20, 0, 0, 0]);
    }

    let shots = drain(&rx).into_iter().filter(|m| m.kind == DoneKind::Shot).count();
    assert_eq!(shots, 50);
}

#[tokio::test]
async fn test_signal_after_retirement_is_rejected() {
    let rig = Rig::new(test_config());
    rig.open(I0, LINE, TriggerMode::OnDemand, 1_000);
    rig.scheduler.grp_shot(I0, &FrameTemplate::new(2, line_outputs())).unwrap();
    let view = match rig.scheduler.frame_start(HEAD, I0).unwrap() {
        StartOutcome::Started(view) => view,
        other => panic!("unexpected {:?}", other),
    };
    for event in line_signals(I0, &view) {
        rig.scheduler.frame_done(event).unwrap();
    }

    let late = DoneEvent::outputs(TAIL, I0).with_frame(view.handle);
    assert!(rig.scheduler.frame_done(late).is_err());
    assert_eq!(rig.scheduler.statistics().retired, 1);
    assert_eq!(rig.scheduler.statistics().protocol_violations, 1);
}

#[tokio::test]
async fn test_done_without_frame_uses_oldest_waiting() {
    let rig = Rig::new(test_config());
    let chain = rig.open(I0, SINGLE, TriggerMode::OnDemand, 1_000);

    rig.scheduler.grp_shot(I0, &FrameTemplate::new(1, OutputSet::single(M2M_OUT))).unwrap();
    rig.scheduler.frame_start(M2M, I0).unwrap();

    let outcome = rig.scheduler.frame_done(DoneEvent::outputs(M2M, I0)).unwrap();
    assert_eq!(outcome.view().fcount, 1);
    assert!(outcome.is_retired());
    assert_eq!(chain.queue().in_flight(), 0);

    // nothing left to complete
    assert!(matches!(
        rig.scheduler.frame_done(DoneEvent::outputs(M2M, I0)),
        Err(SchedError::EmptyBucket(FrameState::WaitCompletion))
    ));
}

#[tokio::test]
async fn test_foreign_output_is_rejected() {
    let rig = Rig::new(test_config());
    let chain = rig.open(I0, LINE, TriggerMode::OnDemand, 1_000);
    rig.scheduler.grp_shot(I0, &FrameTemplate::new(3, line_outputs())).unwrap();
    rig.scheduler.frame_start(HEAD, I0).unwrap();

    let err = rig
        .scheduler
        .frame_done(DoneEvent::output(MID, I0, TAIL_OUT))
        .unwrap_err();
    assert!(matches!(err, SchedError::InvalidOutput(o) if o == TAIL_OUT));

    let view = chain.queue().peek(FrameState::WaitCompletion).unwrap();
    assert!(view.out_flag.contains(TAIL_OUT));
    assert!(view.out_flag.contains(MID_OUT));
}

#[tokio::test]
async fn test_failed_done_reason_sticks_to_the_shot() {
    let rig = Rig::new(test_config());
    rig.open(I0, LINE, TriggerMode::OnDemand, 1_000);
    let rx = rig.scheduler.subscribe();
    rig.scheduler.grp_shot(I0, &FrameTemplate::new(6, line_outputs())).unwrap();
    let view = match rig.scheduler.frame_start(HEAD, I0).unwrap() {
        StartOutcome::Started(view) => view,
        other => panic!("unexpected {:?}", other),
    };

    let mut signals = line_signals(I0, &view);
    signals[1] = signals[1].with_reason(DoneReason::Overflow);
    for event in signals {
        rig.scheduler.frame_done(event).unwrap();
    }

    let shot = drain(&rx).into_iter().find(|m| m.kind == DoneKind::Shot).unwrap();
    assert_eq!(shot.fcount, 6);
    assert_eq!(shot.reason, DoneReason::Overflow);
}

#[tokio::test]
async fn test_frame_ndone_retires_dispatched_frame() {
    let rig = Rig::new(test_config());
    let chain = rig.open(I0, LINE, TriggerMode::OnDemand, 1_000);
    let rx = rig.scheduler.subscribe();
    rig.scheduler.grp_shot(I0, &FrameTemplate::new(4, line_outputs())).unwrap();
    let view = chain.queue().peek(FrameState::Configured).unwrap();

    let outcome = rig.scheduler.frame_ndone(I0, view.handle, DoneReason::Unprocessed).unwrap();
    assert!(outcome.is_retired());
    assert_eq!(chain.queue().in_flight(), 0);

    let ndone: Vec<&str> = rig.calls("ndone").iter().map(|c| c.stage).collect();
    assert_eq!(ndone, vec!["head", "mid", "tail"]);

    let shot = drain(&rx).into_iter().find(|m| m.kind == DoneKind::Shot).unwrap();
    assert_eq!(shot.reason, DoneReason::Unprocessed);

    // the handle is stale once the record is back in the pool
    assert!(matches!(
        rig.scheduler.frame_ndone(I0, view.handle, DoneReason::Unprocessed),
        Err(SchedError::StaleFrame { .. })
    ));
}

#[tokio::test]
async fn test_multi_buffer_fans_out_in_order() {
    let rig = Rig::new(test_config());
    let chain = rig.open(I0, SINGLE, TriggerMode::OnDemand, 1_000);
    let rx = rig.scheduler.subscribe();

    let planes = (0..4).map(|i| PlaneBuffer { dva: 0x10_0000 * (i + 1), kva: 0 }).collect();
    let burst = FrameTemplate::new(21, OutputSet::single(M2M_OUT))
        .with_planes(planes)
        .with_buffers(4);
    rig.scheduler.grp_shot(I0, &burst).unwrap();

    let mut seen = Vec::new();
    for _ in 0..200 {
        if seen.len() == 4 {
            break;
        }
        if chain.queue().len(FrameState::Configured) == 0 {
            // the multi-shot worker dispatches the next replica
            tokio::time::sleep(Duration::from_millis(1)).await;
            continue;
        }
        let view = match rig.scheduler.frame_start(M2M, I0).unwrap() {
            StartOutcome::Started(view) => view,
            other => panic!("unexpected {:?}", other),
        };
        seen.push((view.cur_buf_index, view.planes()[0].dva, view.batch_last));
        assert!(rig
            .scheduler
            .frame_done(DoneEvent::outputs(M2M, I0).with_frame(view.handle))
            .unwrap()
            .is_retired());
    }

    assert_eq!(
        seen,
        vec![
            (0, 0x10_0000, false),
            (1, 0x20_0000, false),
            (2, 0x30_0000, false),
            (3, 0x40_0000, true),
        ]
    );
    assert_eq!(rig.calls("shot").len(), 4);
    assert_eq!(chain.queue().in_flight(), 0);

    let shots: Vec<_> = drain(&rx).into_iter().filter(|m| m.kind == DoneKind::Shot).collect();
    assert_eq!(shots.len(), 1);
    assert_eq!(shots[0].fcount, 21);
}
