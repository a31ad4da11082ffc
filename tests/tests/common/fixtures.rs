use lyra_progressive::testing::{FakeContainer, FakeTrackKind};
use rstest::*;

pub const SAMPLE_STEP_US: i64 = 20_000;

pub type Samples = Vec<(i64, Vec<u8>)>;

#[fixture]
pub fn tracing_setup() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::default()
                .add_directive("warn".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}

#[fixture]
pub fn debug_tracing_setup() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::default()
                .add_directive("lyra_progressive=debug".parse().expect("valid directive"))
                .add_directive("lyra_loader=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}

/// Audio and video sample every step; video keyframes every fifth sample.
pub fn audio_video(count: i64) -> (FakeContainer, Samples, Samples) {
    let mut container = FakeContainer::new()
        .with_track(1, FakeTrackKind::Audio)
        .with_track(2, FakeTrackKind::Video);
    let mut audio = Vec::new();
    let mut video = Vec::new();
    for i in 0..count {
        let time_us = i * SAMPLE_STEP_US;
        let audio_payload = FakeContainer::payload(1, time_us, 400);
        let video_payload = FakeContainer::payload(2, time_us, 1_500);
        container = container
            .with_sample(1, time_us, true, audio_payload.clone())
            .with_sample(2, time_us, i % 5 == 0, video_payload.clone());
        audio.push((time_us, audio_payload));
        video.push((time_us, video_payload));
    }
    (container, audio, video)
}
