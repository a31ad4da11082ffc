//! Standalone fixture server streaming a generated progressive container.
//!
//! Serves an audio/video container in the test container format with
//! byte-range support on a fixed port.
//!
//! ```bash
//! cargo run -p lyra-tests --bin progressive_fixture_server
//! # → Listening on http://127.0.0.1:3334/media
//! ```

use lyra_progressive::testing::{FakeContainer, FakeTrackKind};
use lyra_tests::RangeServer;

const PORT: u16 = 3334;
const SAMPLE_COUNT: i64 = 3_000;
const SAMPLE_STEP_US: i64 = 20_000;
const AUDIO_SAMPLE_SIZE: usize = 417;
const VIDEO_SAMPLE_SIZE: usize = 4_000;
const KEYFRAME_INTERVAL: i64 = 25;

fn container() -> Vec<u8> {
    let mut container = FakeContainer::new()
        .with_track(1, FakeTrackKind::Audio)
        .with_track(2, FakeTrackKind::Video);
    for i in 0..SAMPLE_COUNT {
        let time_us = i * SAMPLE_STEP_US;
        container = container
            .with_sample(1, time_us, true, FakeContainer::payload(1, time_us, AUDIO_SAMPLE_SIZE))
            .with_sample(
                2,
                time_us,
                i % KEYFRAME_INTERVAL == 0,
                FakeContainer::payload(2, time_us, VIDEO_SAMPLE_SIZE),
            );
    }
    container.build()
}

#[tokio::main]
async fn main() {
    let body = container();
    let len = body.len();
    let addr = format!("127.0.0.1:{PORT}");
    let server = RangeServer::bind(&addr, body)
        .await
        .unwrap_or_else(|e| panic!("failed to bind {addr}: {e}"));

    println!("Progressive fixture server listening on {}", server.url("/media"));
    println!(
        "{SAMPLE_COUNT} audio + {SAMPLE_COUNT} video samples, {len} bytes, {} s",
        SAMPLE_COUNT * SAMPLE_STEP_US / 1_000_000
    );
    println!("Press Ctrl+C to stop");

    std::future::pending::<()>().await;
}
