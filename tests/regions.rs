mod common;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rgdl::store::load_states;
use rgdl::{
    Catalog, Config, FileProgress, FileRole, RegionDownloadState, RegionDownloader, RegionEntry,
    RegionListener, StateStore, Status,
};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::RangeFile;

// Malta: two elevation cells, N35E014 and N36E014.
const MALTA_POLY: &str = "malta
1
   1.4180E+01   3.5800E+01
   1.4580E+01   3.5800E+01
   1.4580E+01   3.6080E+01
   1.4180E+01   3.6080E+01
END
END
";

#[derive(Default)]
struct Recorder {
    progress: Mutex<u32>,
    completed: Mutex<Vec<String>>,
    errors: Mutex<Vec<(String, String)>>,
}

impl RegionListener for Recorder {
    fn on_progress(&self, _: &RegionEntry, _: &RegionDownloadState) {
        *self.progress.lock().unwrap() += 1;
    }

    fn on_complete(&self, region: &RegionEntry, _: &RegionDownloadState) {
        self.completed.lock().unwrap().push(region.path.clone());
    }

    fn on_error(&self, region: &RegionEntry, message: &str) {
        self.errors
            .lock()
            .unwrap()
            .push((region.path.clone(), message.to_string()));
    }
}

fn config(server: &MockServer, data_dir: &Path) -> Config {
    Config {
        data_dir: data_dir.to_path_buf(),
        map_base_url: format!("{}/maps", server.uri()),
        poi_base_url: format!("{}/pois", server.uri()),
        boundary_base_url: server.uri(),
        elevation_base_url: format!("{}/skadi", server.uri()),
        concurrency: 2,
        ..Config::default()
    }
}

fn downloader_with(config: Config, states: BTreeMap<String, RegionDownloadState>) -> RegionDownloader {
    let catalog = Catalog::from_json(r#"{"europe": ["malta", "gozo"]}"#).unwrap();
    let store = StateStore::with_states(config.state_file(), 1024, states);
    RegionDownloader::with_parts(config, catalog, store)
}

fn downloader(server: &MockServer, data_dir: &Path) -> RegionDownloader {
    downloader_with(config(server, data_dir), BTreeMap::new())
}

async fn mount(server: &MockServer, url_path: &str, body: &[u8]) {
    Mock::given(method("GET"))
        .and(path(url_path))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
        .mount(server)
        .await;
}

async fn mount_malta(server: &MockServer) {
    mount(server, "/europe/malta.poly", MALTA_POLY.as_bytes()).await;
    mount(server, "/maps/europe/malta.map", b"map-bytes").await;
    mount(server, "/pois/europe/malta.poi", b"poi").await;
    // N36E014 is left unmounted: the mock answers 404, like an ocean cell.
    mount(server, "/skadi/N35/N35E014.hgt.gz", b"tile").await;
}

async fn download(downloader: &RegionDownloader, region_path: &str, listener: Arc<Recorder>) {
    let region = downloader.region(region_path);
    assert!(downloader.start(&region, listener).await.unwrap());
    downloader.join(region_path).await;
}

#[tokio::test]
async fn downloads_every_part_of_a_region() {
    let server = MockServer::start().await;
    mount_malta(&server).await;
    let temp = TempDir::new().unwrap();
    let downloader = downloader(&server, temp.path());
    let listener = Arc::new(Recorder::default());

    download(&downloader, "europe/malta", listener.clone()).await;

    let state = downloader.state("europe/malta");
    assert_eq!(state.status, Status::Completed);
    assert_eq!(state.map.downloaded, 9);
    assert_eq!(state.map.total, 9);
    assert_eq!(state.poi.total, 3);
    assert_eq!(state.boundary.total, MALTA_POLY.len() as u64);
    assert_eq!(state.tiles_total, 2);
    assert_eq!(state.tiles_downloaded, 2);
    assert!(state.last_error.is_none());

    let data = temp.path();
    assert_eq!(
        std::fs::read(data.join("maps/europe/malta.map")).unwrap(),
        b"map-bytes"
    );
    assert!(data.join("poi/europe/malta.poi").exists());
    assert!(data.join("boundaries/europe/malta.poly").exists());
    assert_eq!(
        std::fs::read(data.join("elevation/N35/N35E014.hgt.gz")).unwrap(),
        b"tile"
    );
    assert!(!data.join("elevation/N35/N35E014.hgt.gz.part").exists());
    assert!(!data.join("elevation/N36/N36E014.hgt.gz").exists());

    assert_eq!(*listener.completed.lock().unwrap(), vec!["europe/malta".to_string()]);
    assert!(listener.errors.lock().unwrap().is_empty());
    assert!(*listener.progress.lock().unwrap() > 0);
    assert!(!downloader.is_active("europe/malta"));

    let saved = load_states(&downloader.config().state_file()).await.unwrap();
    assert_eq!(saved["europe/malta"].status, Status::Completed);
    // Never-started catalog regions stay out of the document.
    assert!(!saved.contains_key("europe/gozo"));
}

#[tokio::test]
async fn existing_tiles_are_counted_without_fetching() {
    let server = MockServer::start().await;
    mount(&server, "/europe/malta.poly", MALTA_POLY.as_bytes()).await;
    Mock::given(method("GET"))
        .and(path("/skadi/N35/N35E014.hgt.gz"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"tile".to_vec()))
        .expect(0)
        .mount(&server)
        .await;

    let temp = TempDir::new().unwrap();
    let tile = temp.path().join("elevation/N35/N35E014.hgt.gz");
    std::fs::create_dir_all(tile.parent().unwrap()).unwrap();
    std::fs::write(&tile, b"already here").unwrap();

    let downloader = downloader(&server, temp.path());
    download(&downloader, "europe/malta", Arc::new(Recorder::default())).await;

    let state = downloader.state("europe/malta");
    assert_eq!(state.status, Status::Completed);
    assert_eq!(state.tiles_downloaded, 2);
    assert_eq!(std::fs::read(&tile).unwrap(), b"already here");
}

#[tokio::test]
async fn missing_boundary_skips_tiles() {
    let server = MockServer::start().await;
    mount(&server, "/maps/europe/malta.map", b"map-bytes").await;

    let temp = TempDir::new().unwrap();
    let downloader = downloader(&server, temp.path());
    download(&downloader, "europe/malta", Arc::new(Recorder::default())).await;

    let state = downloader.state("europe/malta");
    assert_eq!(state.status, Status::Completed);
    assert_eq!(state.tiles_total, 0);
    assert_eq!(state.boundary.total, 0);
    assert_eq!(state.map.total, 9);
}

#[tokio::test]
async fn server_error_marks_region_as_error() {
    let server = MockServer::start().await;
    mount(&server, "/europe/malta.poly", MALTA_POLY.as_bytes()).await;
    Mock::given(method("GET"))
        .and(path("/maps/europe/malta.map"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let temp = TempDir::new().unwrap();
    let downloader = downloader(&server, temp.path());
    let listener = Arc::new(Recorder::default());
    download(&downloader, "europe/malta", listener.clone()).await;

    let state = downloader.state("europe/malta");
    assert_eq!(state.status, Status::Error);
    assert!(state.status.is_resumable());
    assert!(state.last_error.is_some());
    // The boundary finished before the failure and is kept.
    assert!(state.boundary.is_complete());

    let errors = listener.errors.lock().unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, "europe/malta");
    assert!(listener.completed.lock().unwrap().is_empty());
}

#[tokio::test]
async fn failed_region_can_be_resumed() {
    let server = MockServer::start().await;
    mount(&server, "/europe/malta.poly", MALTA_POLY.as_bytes()).await;
    Mock::given(method("GET"))
        .and(path("/maps/europe/malta.map"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount(&server, "/maps/europe/malta.map", b"map-bytes").await;

    let temp = TempDir::new().unwrap();
    let downloader = downloader(&server, temp.path());
    download(&downloader, "europe/malta", Arc::new(Recorder::default())).await;
    assert_eq!(downloader.state("europe/malta").status, Status::Error);

    download(&downloader, "europe/malta", Arc::new(Recorder::default())).await;
    let state = downloader.state("europe/malta");
    assert_eq!(state.status, Status::Completed);
    assert!(state.last_error.is_none());
}

#[tokio::test]
async fn second_start_while_running_is_refused() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404).set_delay(Duration::from_millis(300)))
        .mount(&server)
        .await;

    let temp = TempDir::new().unwrap();
    let downloader = downloader(&server, temp.path());
    let region = downloader.region("europe/malta");
    let listener = Arc::new(Recorder::default());

    assert!(downloader.start(&region, listener.clone()).await.unwrap());
    assert!(downloader.is_active("europe/malta"));
    assert!(!downloader.start(&region, listener.clone()).await.unwrap());

    downloader.cancel("europe/malta").await;
    assert!(!downloader.is_active("europe/malta"));
    assert_eq!(downloader.state("europe/malta").status, Status::Paused);
    assert!(listener.completed.lock().unwrap().is_empty());
}

#[tokio::test]
async fn invalid_region_paths_are_rejected() {
    let server = MockServer::start().await;
    let temp = TempDir::new().unwrap();
    let downloader = downloader(&server, temp.path());
    let listener = Arc::new(Recorder::default());

    let region = RegionEntry::from_path("europe/../../etc");
    assert!(downloader.start(&region, listener).await.is_err());
    assert!(downloader.delete("europe").await.is_err());
}

#[tokio::test]
async fn delete_removes_region_files_but_keeps_tiles() {
    let server = MockServer::start().await;
    mount_malta(&server).await;
    let temp = TempDir::new().unwrap();
    let downloader = downloader(&server, temp.path());
    download(&downloader, "europe/malta", Arc::new(Recorder::default())).await;

    downloader.delete("europe/malta").await.unwrap();

    for role in FileRole::ALL {
        assert!(!downloader.config().local_file(role, "europe/malta").exists());
    }
    assert!(temp.path().join("elevation/N35/N35E014.hgt.gz").exists());
    assert_eq!(downloader.state("europe/malta"), RegionDownloadState::default());

    let saved = load_states(&downloader.config().state_file()).await.unwrap();
    assert!(!saved.contains_key("europe/malta"));
}

#[tokio::test]
async fn interrupted_run_loads_as_paused() {
    let temp = TempDir::new().unwrap();
    let state_file = temp.path().join("download_state.json");
    std::fs::write(
        &state_file,
        r#"{"regions":{"europe/malta":{"status":"IN_PROGRESS","map":{"downloaded":4,"total":9}}}}"#,
    )
    .unwrap();

    let config = Config {
        data_dir: temp.path().to_path_buf(),
        ..Config::default()
    };
    let downloader = RegionDownloader::new(config).await;

    let state = downloader.state("europe/malta");
    assert_eq!(state.status, Status::Paused);
    assert_eq!(state.map.downloaded, 4);
    assert!(downloader.catalog().find("europe/germany/bayern").is_some());
}

#[tokio::test]
async fn paused_region_resumes_with_range_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/maps/europe/malta.map"))
        .respond_with(RangeFile(b"map-bytes".to_vec()))
        .mount(&server)
        .await;

    let temp = TempDir::new().unwrap();
    let map = temp.path().join("maps/europe/malta.map");
    std::fs::create_dir_all(map.parent().unwrap()).unwrap();
    std::fs::write(&map, b"map-").unwrap();

    let mut states = BTreeMap::new();
    states.insert(
        "europe/malta".to_string(),
        RegionDownloadState {
            status: Status::Paused,
            map: FileProgress::new(4, 9),
            ..Default::default()
        },
    );
    let downloader = downloader_with(config(&server, temp.path()), states);
    download(&downloader, "europe/malta", Arc::new(Recorder::default())).await;

    let state = downloader.state("europe/malta");
    assert_eq!(state.status, Status::Completed);
    assert_eq!(state.map, FileProgress::new(9, 9));
    assert_eq!(std::fs::read(&map).unwrap(), b"map-bytes");

    let requests = server.received_requests().await.unwrap();
    let map_request = requests
        .iter()
        .find(|r| r.url.path() == "/maps/europe/malta.map")
        .unwrap();
    let range = map_request.headers.get("range").unwrap().to_str().unwrap();
    assert_eq!(range, "bytes=4-");
}

#[tokio::test]
async fn regions_sharing_a_tile_fetch_it_once() {
    let server = MockServer::start().await;
    mount(&server, "/europe/malta.poly", MALTA_POLY.as_bytes()).await;
    mount(&server, "/europe/gozo.poly", MALTA_POLY.as_bytes()).await;
    Mock::given(method("GET"))
        .and(path("/skadi/N35/N35E014.hgt.gz"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(b"tile".to_vec())
                .set_delay(Duration::from_millis(300)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let temp = TempDir::new().unwrap();
    let downloader = downloader(&server, temp.path());
    let listener = Arc::new(Recorder::default());
    for region in ["europe/malta", "europe/gozo"] {
        let entry = downloader.region(region);
        assert!(downloader.start(&entry, listener.clone()).await.unwrap());
    }
    downloader.join("europe/malta").await;
    downloader.join("europe/gozo").await;

    for region in ["europe/malta", "europe/gozo"] {
        let state = downloader.state(region);
        assert_eq!(state.status, Status::Completed);
        assert_eq!(state.tiles_downloaded, 2);
    }
    assert_eq!(
        std::fs::read(temp.path().join("elevation/N35/N35E014.hgt.gz")).unwrap(),
        b"tile"
    );
    assert_eq!(listener.completed.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn local_write_failure_marks_region_as_partial() {
    let server = MockServer::start().await;
    mount(&server, "/maps/europe/malta.map", b"map-bytes").await;

    let temp = TempDir::new().unwrap();
    // A plain file where the data directory should be.
    let data_dir = temp.path().join("data");
    std::fs::write(&data_dir, b"not a directory").unwrap();

    let downloader = downloader(&server, &data_dir);
    let listener = Arc::new(Recorder::default());
    download(&downloader, "europe/malta", listener.clone()).await;

    let state = downloader.state("europe/malta");
    assert_eq!(state.status, Status::Partial);
    assert!(state.status.is_resumable());
    assert!(state.last_error.is_some());
    assert_eq!(listener.errors.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn queued_region_can_be_deleted_without_waiting() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/maps/europe/malta.map"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(b"map-bytes".to_vec())
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let temp = TempDir::new().unwrap();
    let config = Config {
        concurrency: 1,
        ..config(&server, temp.path())
    };
    let downloader = downloader_with(config, BTreeMap::new());
    let listener = Arc::new(Recorder::default());

    let malta = downloader.region("europe/malta");
    assert!(downloader.start(&malta, listener.clone()).await.unwrap());
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Gozo waits for the only worker, which malta holds.
    let gozo = downloader.region("europe/gozo");
    assert!(downloader.start(&gozo, listener.clone()).await.unwrap());
    tokio::time::sleep(Duration::from_millis(100)).await;

    tokio::time::timeout(Duration::from_secs(1), downloader.delete("europe/gozo"))
        .await
        .expect("delete of a queued region blocked on another region")
        .unwrap();
    assert_eq!(downloader.state("europe/gozo"), RegionDownloadState::default());
    assert!(downloader.is_active("europe/malta"));

    // A restart after cancel is not held up either.
    assert!(downloader.start(&gozo, listener.clone()).await.unwrap());
    downloader.cancel("europe/gozo").await;
    tokio::time::timeout(Duration::from_secs(1), downloader.join("europe/gozo"))
        .await
        .expect("cancelled queued region did not drain");
    assert_eq!(downloader.state("europe/gozo").status, Status::Paused);

    downloader.cancel("europe/malta").await;
}

#[tokio::test]
async fn join_waits_for_cancelled_run_to_drain() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404).set_delay(Duration::from_millis(300)))
        .mount(&server)
        .await;

    let temp = TempDir::new().unwrap();
    let downloader = downloader(&server, temp.path());
    let listener = Arc::new(Recorder::default());
    let region = downloader.region("europe/malta");

    assert!(downloader.start(&region, listener.clone()).await.unwrap());
    tokio::time::sleep(Duration::from_millis(50)).await;
    downloader.cancel("europe/malta").await;
    // The run still holds its listener while its request is in flight.
    assert_eq!(Arc::strong_count(&listener), 2);

    downloader.join("europe/malta").await;
    assert_eq!(Arc::strong_count(&listener), 1);
    assert_eq!(downloader.state("europe/malta").status, Status::Paused);

    let saved = load_states(&downloader.config().state_file()).await.unwrap();
    assert_eq!(saved["europe/malta"].status, Status::Paused);
}
