use std::{sync::Arc, time::Duration};

use lyra::{
    loader::DefaultLoadErrorHandlingPolicy,
    prelude::*,
    progressive::{
        ByteArrayDataSource,
        testing::{FakeExtractor, FlakyDataSource},
    },
};
use rstest::*;

use crate::common::{audio_video, drain, prepare_and_select_all, tracing_setup};

fn quick_retries() -> Arc<dyn LoadErrorHandlingPolicy> {
    Arc::new(
        DefaultLoadErrorHandlingPolicy::default()
            .with_first_retry_delay(Duration::from_millis(5))
            .with_retry_delay_step(Duration::from_millis(5)),
    )
}

/// A known length lets a failed load resume where it stopped.
#[rstest]
#[case(1, None)]
#[case(0, Some(5_000))]
#[case(2, Some(20_000))]
#[timeout(Duration::from_secs(20))]
fn test_failed_load_resumes_without_loss(
    _tracing_setup: (),
    #[case] failing_opens: u32,
    #[case] read_failure_at: Option<u64>,
) {
    let (container, audio, video) = audio_video(30);
    let inner = ByteArrayDataSource::new(container.build());
    let probe = inner.probe();
    let mut source = FlakyDataSource::new(inner).with_failing_opens(failing_opens);
    if let Some(position) = read_failure_at {
        source = source.with_read_failure_at(position);
    }
    let period = ProgressiveMediaPeriod::new(
        None,
        Box::new(source),
        Box::new(FakeExtractor::new()),
        ProgressiveConfig::default().with_load_error_handling_policy(quick_retries()),
    )
    .unwrap();
    let mut rx = period.bus().subscribe();

    let streams = prepare_and_select_all(&period);
    assert_eq!(drain(&streams[0]), audio);
    assert_eq!(drain(&streams[1]), video);
    period.release();

    if let Some(position) = read_failure_at {
        assert_eq!(probe.opens(), vec![0, position]);
    } else {
        assert_eq!(probe.opens(), vec![0]);
    }

    let mut retries = 0;
    let mut completed = 0;
    while let Ok(event) = rx.try_recv() {
        match event {
            Event::Load(LoadEvent::Error { will_retry, .. }) => {
                assert!(will_retry);
                retries += 1;
            }
            Event::Load(LoadEvent::Completed { .. }) => completed += 1,
            _ => {}
        }
    }
    assert_eq!(retries, failing_opens + u32::from(read_failure_at.is_some()));
    assert_eq!(completed, 1);
}
