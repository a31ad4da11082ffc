use std::time::Duration;

use lyra::{
    SourceConfig, open_progressive,
    loader::LoadError,
    prelude::*,
    progressive::{ProgressiveError, testing::FakeExtractor},
};
use lyra_tests::RangeServer;
use rstest::*;
use tokio::runtime::Handle;

use crate::common::{audio_video, drain, prepare_and_select_all, tracing_setup, wait_until};

fn open(server: &RangeServer, path: &str) -> ProgressiveMediaPeriod {
    let config = SourceConfig::from_url(server.url(path))
        .with_connect_timeout(Duration::from_secs(2))
        .with_period_config(ProgressiveConfig::default().with_name("http-test"));
    open_progressive(config, Box::new(FakeExtractor::new()), Handle::current()).unwrap()
}

#[rstest]
#[timeout(Duration::from_secs(20))]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_http_stream_is_read_completely(_tracing_setup: ()) {
    let (container, audio, video) = audio_video(50);
    let server = RangeServer::spawn(container.build()).await;
    let period = open(&server, "/media");

    tokio::task::spawn_blocking(move || {
        let streams = prepare_and_select_all(&period);
        assert_eq!(period.duration_us(), Some(container.duration_us()));
        assert_eq!(drain(&streams[0]), audio);
        assert_eq!(drain(&streams[1]), video);
        period.release();
    })
    .await
    .unwrap();

    assert_eq!(server.range_requests(), vec![Some("bytes=0-".to_owned())]);
}

#[rstest]
#[timeout(Duration::from_secs(20))]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_seek_outside_buffer_requests_range_from_sync_point(_tracing_setup: ()) {
    let (container, audio, video) = audio_video(30);
    let server = RangeServer::spawn(container.build()).await;
    let period = open(&server, "/media");

    tokio::task::spawn_blocking(move || {
        let streams = prepare_and_select_all(&period);
        drain(&streams[0]);
        drain(&streams[1]);

        period.discard_buffer(i64::MAX, false);
        assert_eq!(period.seek_to_us(200_000), 200_000);
        assert!(period.continue_loading(200_000));

        // The video keyframe at 200ms is written after the audio sample of
        // the same time, so audio resumes one sample later.
        assert_eq!(drain(&streams[1]), video[10..].to_vec());
        assert_eq!(drain(&streams[0]), audio[11..].to_vec());
        period.release();
    })
    .await
    .unwrap();

    let requests = server.range_requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].as_deref(), Some("bytes=0-"));
    let resumed = requests[1].as_deref().unwrap();
    assert!(resumed.starts_with("bytes=") && resumed != "bytes=0-");
}

#[rstest]
#[timeout(Duration::from_secs(20))]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_missing_resource_is_fatal(_tracing_setup: ()) {
    let server = RangeServer::spawn(Vec::new()).await;
    let period = open(&server, "/missing");

    tokio::task::spawn_blocking(move || {
        period.prepare(std::sync::Arc::new(crate::common::ContinueCallback::default()), 0);
        wait_until("fatal error", || period.maybe_throw_prepare_error().is_err());

        let Err(ProgressiveError::Load(LoadError::Fatal(source))) = period.maybe_throw_prepare_error()
        else {
            panic!("expected a fatal load error");
        };
        assert!(matches!(
            *source,
            LoadError::Net {
                status: Some(404),
                ..
            }
        ));
        assert!(!period.is_prepared());
        period.release();
    })
    .await
    .unwrap();
}
