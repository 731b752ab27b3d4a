use std::time::Duration;

use pixelpipe::download::{DownloadTimeouts, HttpTransport, Transport};
use pixelpipe::{ImageLoader, LoadedFrom, PixelFormat, Spec};
use tokio::io::AsyncReadExt;
use pixelpipe_test::ImageServer;

use crate::utils::{Outcome, Recorder, build_loader, eventually, load, setup_loader};

#[tokio::test]
async fn test_network_then_disk_then_memory() {
    let server = ImageServer::new();
    let (loader, _cache_dir) = setup_loader(|_| ());
    let uri = server.url("png/100/100/cat.png");

    let Outcome::Loaded(buffer, source) = load(&loader, &uri, "thumb").await else {
        panic!("network load failed");
    };
    assert_eq!(source, LoadedFrom::Network);
    assert_eq!((buffer.width(), buffer.height()), (100, 100));
    assert_eq!(buffer.pixels().len(), 100 * 100 * 4);
    assert_eq!(buffer.bound_uri().as_deref(), Some(uri.as_str()));

    let memory = Recorder::new(&uri, "thumb");
    loader.load(memory.clone(), None);
    assert!(matches!(
        &memory.outcomes()[..],
        [Outcome::Loaded(_, LoadedFrom::Memory)]
    ));

    loader.clear_memory();
    let (_, source) = Recorder::new(&uri, "thumb").loaded_via(&loader).await;
    assert_eq!(source, LoadedFrom::Disk);

    assert_eq!(server.hits("png/100/100/cat.png"), 1);
    assert!(loader.cache_path(&uri, "thumb").unwrap().is_file());
}

#[tokio::test]
async fn test_error_status_fails() {
    let server = ImageServer::new();
    let (loader, _cache_dir) = setup_loader(|_| ());

    let uri = server.url("respond_statuscode/500/cat.png");
    assert!(matches!(load(&loader, &uri, "thumb").await, Outcome::Failed));
    assert_eq!(loader.stats().network_failure, 1);
    assert!(!loader.cache_path(&uri, "thumb").unwrap().exists());
}

#[tokio::test]
async fn test_garbage_fails_to_decode() {
    let server = ImageServer::new();
    let (loader, _cache_dir) = setup_loader(|_| ());

    let uri = server.url("garbage_data/not-an-image");
    assert!(matches!(load(&loader, &uri, "thumb").await, Outcome::Failed));
    // the bytes arrived, they just are no image
    assert_eq!(loader.stats().network_success, 1);
}

#[tokio::test]
async fn test_redirects_are_followed() {
    let server = ImageServer::new();
    let (loader, _cache_dir) = setup_loader(|_| ());

    let uri = server.url("redirect/png/100/100/cat.png");
    let (_, source) = Recorder::new(&uri, "thumb").loaded_via(&loader).await;
    assert_eq!(source, LoadedFrom::Network);
    assert_eq!(server.hits("png/100/100/cat.png"), 1);
}

#[tokio::test]
async fn test_response_length_is_kept() {
    pixelpipe_test::setup();
    let server = ImageServer::new();
    let url = server.url("compressible/100/100/cat.png");

    // the route compresses for clients asking for it
    let compressed = reqwest::Client::new()
        .get(&url)
        .header("accept-encoding", "gzip")
        .send()
        .await
        .unwrap();
    assert_eq!(compressed.headers()["content-encoding"], "gzip");

    let transport = HttpTransport::new(DownloadTimeouts::default()).unwrap();
    let mut response = transport.execute(&url).await.unwrap();
    let mut body = Vec::new();
    response.body.read_to_end(&mut body).await.unwrap();

    assert!(body.starts_with(b"\x89PNG"));
    assert_eq!(response.content_length, Some(body.len() as u64));
}

#[tokio::test]
async fn test_head_timeout() {
    let server = ImageServer::new();
    let (loader, _cache_dir) = setup_loader(|config| {
        config.downloads.head_timeout = Duration::from_millis(100);
    });

    let uri = server.url("slow/2s/100/100/cat.png");
    assert!(matches!(load(&loader, &uri, "thumb").await, Outcome::Failed));
}

#[tokio::test]
async fn test_uri_adapter_requests_spec_size() {
    let server = ImageServer::new();
    pixelpipe_test::setup();
    let cache_dir = pixelpipe_test::tempdir();

    let base = server.url("png");
    let config = pixelpipe::Config {
        cache_dir: Some(cache_dir.path().to_owned()),
        ..Default::default()
    };
    let spec = Spec::builder("avatar")
        .size(40, 30)
        .pixel_format(PixelFormat::Alpha8)
        .build()
        .unwrap();
    let loader = ImageLoader::builder(config)
        .spec(spec)
        .uri_adapter(move |uri: &str, spec: &Spec| {
            let name = uri.trim_start_matches("avatar://");
            format!("{base}/{}/{}/{name}", spec.width(), spec.height())
        })
        .build()
        .unwrap();

    let (buffer, _) = Recorder::new("avatar://jane", "avatar")
        .loaded_via(&loader)
        .await;
    assert_eq!((buffer.width(), buffer.height()), (40, 30));
    assert_eq!(buffer.pixels().len(), 40 * 30);
    // pooled and cached under the original uri
    assert_eq!(buffer.bound_uri().as_deref(), Some("avatar://jane"));
    assert!(loader.cache_path("avatar://jane", "avatar").unwrap().is_file());
    assert_eq!(server.hits("png/40/30/jane"), 1);
}

#[tokio::test]
async fn test_prefetch_warms_the_disk_cache() {
    let server = ImageServer::new();
    let (loader, _cache_dir) = setup_loader(|_| ());
    let uri = server.url("png/100/100/dog.png");

    loader.prefetch(&uri, "thumb").unwrap();
    let path = loader.cache_path(&uri, "thumb").unwrap();
    eventually(|| path.is_file()).await;
    // a prefetch does not fill the pool
    assert!(loader.pool().is_empty());

    let (_, source) = Recorder::new(&uri, "thumb").loaded_via(&loader).await;
    assert_eq!(source, LoadedFrom::Disk);

    loader.prefetch(&uri, "thumb").unwrap();
    loader.shutdown().await;
    assert_eq!(server.hits("png/100/100/dog.png"), 1);
}

#[tokio::test]
async fn test_cache_survives_restart() {
    let server = ImageServer::new();
    let (loader, cache_dir) = setup_loader(|_| ());
    let uri = server.url("png/100/100/cat.png");

    Recorder::new(&uri, "thumb").loaded_via(&loader).await;
    loader.shutdown().await;
    drop(loader);

    let loader = build_loader(&cache_dir, |_| ());
    assert!(loader.stats().disk_size > 0);
    let (_, source) = Recorder::new(&uri, "thumb").loaded_via(&loader).await;
    assert_eq!(source, LoadedFrom::Disk);
    assert_eq!(server.hits("png/100/100/cat.png"), 1);

    loader.clear_disk_cache();
    loader.disk_cache().flush().await;
    assert!(!loader.cache_path(&uri, "thumb").unwrap().exists());
    assert_eq!(loader.stats().disk_size, 0);
}
