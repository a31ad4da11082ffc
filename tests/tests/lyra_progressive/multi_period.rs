use std::{thread, time::Duration};

use lyra::{
    bufpool::{Allocator, AllocatorConfig},
    prelude::*,
    progressive::{ByteArrayDataSource, testing::FakeExtractor},
};
use rstest::*;

use crate::common::{audio_video, drain, prepare_and_select_all, tracing_setup, wait_until};

#[rstest]
#[case(2)]
#[case(4)]
#[timeout(Duration::from_secs(30))]
fn test_periods_share_allocator_and_bus(_tracing_setup: (), #[case] periods: usize) {
    let allocator = Allocator::new(AllocatorConfig::default().with_individual_allocation_length(4096));
    let bus = EventBus::new(1024);
    let mut rx = bus.subscribe();

    let handles: Vec<_> = (0..periods)
        .map(|index| {
            let (container, audio, video) = audio_video(20 + index as i64 * 5);
            let config = ProgressiveConfig::default()
                .with_name(format!("period-{index}"))
                .with_allocator(allocator.clone())
                .with_bus(bus.clone())
                .with_continue_loading_check_interval_bytes(8 * 1024);
            let period = ProgressiveMediaPeriod::new(
                None,
                Box::new(ByteArrayDataSource::new(container.build())),
                Box::new(FakeExtractor::new()),
                config,
            )
            .unwrap();
            thread::spawn(move || {
                let streams = prepare_and_select_all(&period);
                assert_eq!(drain(&streams[0]), audio);
                assert_eq!(drain(&streams[1]), video);
                period.release();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let mut prepared = 0;
    let mut released = 0;
    wait_until("released events", || {
        while let Ok(event) = rx.try_recv() {
            match event {
                Event::Period(PeriodEvent::Prepared { track_count, .. }) => {
                    assert_eq!(track_count, 2);
                    prepared += 1;
                }
                Event::Period(PeriodEvent::Released) => released += 1,
                _ => {}
            }
        }
        released == periods
    });
    assert_eq!(prepared, periods);
}
