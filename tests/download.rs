//! Concurrent download scenarios against a mock HTTP server.

use std::fs;
use std::io::Read;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use planetfile::{download_from, latest_from, mirrors_from, PlanetError};
use tempfile::TempDir;
use tokio::runtime::Runtime;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const BODY: &[u8] = b"planet bytes!!";

struct Fixture {
    // The server drops (and shuts down) before its runtime.
    server: MockServer,
    rt: Runtime,
    dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let rt = Runtime::new().expect("tokio runtime");
        let server = rt.block_on(MockServer::start());
        let dir = tempfile::tempdir().expect("temp dir");
        Fixture { server, rt, dir }
    }

    fn mount(&self, mock: Mock) {
        self.rt.block_on(mock.mount(&self.server));
    }

    fn url(&self, name: &str) -> String {
        format!("{}/{name}", self.server.uri())
    }

    fn target(&self, name: &str) -> String {
        self.dir
            .path()
            .join(name)
            .to_str()
            .expect("utf-8 temp path")
            .to_owned()
    }

    fn mount_head(&self, name: &str, size: usize) {
        self.mount(
            Mock::given(method("HEAD"))
                .and(path(format!("/{name}")))
                .respond_with(head_response(size)),
        );
    }
}

/// A 200 whose Content-Length is `size`. The body itself never crosses the
/// wire for a HEAD request; it only sizes the header.
fn head_response(size: usize) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_bytes(vec![0u8; size])
}

#[test]
fn downloads_a_fresh_file() -> Result<()> {
    let fx = Fixture::new();
    fx.mount_head("f.osm.pbf", BODY.len());
    fx.mount(
        Mock::given(method("GET"))
            .and(path("/f.osm.pbf"))
            .and(header("Range", "bytes=0-13"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(BODY)),
    );

    let target = fx.target("f.osm.pbf");
    let dl = download_from(&fx.url("f.osm.pbf"), &*target, &fx.server.uri());
    assert!(dl.error().is_none());

    let status = dl.status();
    assert!(status.done);
    assert_eq!(status.size, BODY.len() as u64);
    assert_eq!(status.downloaded, BODY.len() as u64);
    assert_eq!(status.path.as_deref().map(|p| p.as_str()), Some(&*target));
    assert_eq!(fs::read(&target)?, BODY);

    // After completion the reader is a plain file handle.
    let mut contents = Vec::new();
    dl.reader().read_to_end(&mut contents)?;
    assert_eq!(contents, BODY);
    Ok(())
}

#[test]
fn resumes_a_partial_file_with_a_range_request() -> Result<()> {
    let fx = Fixture::new();
    let target = fx.target("f.osm.pbf");
    fs::write(&target, &BODY[..3])?;

    fx.mount_head("f.osm.pbf", BODY.len());
    fx.mount(
        Mock::given(method("GET"))
            .and(path("/f.osm.pbf"))
            .and(header("Range", "bytes=3-13"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(&BODY[3..])),
    );

    let dl = download_from(&fx.url("f.osm.pbf"), &*target, &fx.server.uri());

    // Progress only ever moves forward.
    let mut last = dl.status();
    loop {
        let status = dl.status();
        assert!(status.downloaded >= last.downloaded);
        assert!(status.size >= last.size);
        if status.done {
            break;
        }
        last = status;
        thread::sleep(Duration::from_millis(1));
    }

    assert!(dl.error().is_none());
    assert_eq!(fs::read(&target)?, BODY);
    assert_eq!(dl.status().downloaded, BODY.len() as u64);
    Ok(())
}

#[test]
fn an_already_complete_file_skips_the_get() -> Result<()> {
    let fx = Fixture::new();
    let target = fx.target("f.osm.pbf");
    fs::write(&target, BODY)?;

    // Only HEAD is mounted; a GET would 404 and fail the download.
    fx.mount_head("f.osm.pbf", BODY.len());

    let dl = download_from(&fx.url("f.osm.pbf"), &*target, &fx.server.uri());
    assert!(dl.error().is_none());
    assert!(dl.status().done);

    let mut contents = Vec::new();
    dl.reader().read_to_end(&mut contents)?;
    assert_eq!(contents, BODY);
    Ok(())
}

#[test]
fn an_oversized_local_file_is_corrupt() -> Result<()> {
    let fx = Fixture::new();
    let target = fx.target("f.osm.pbf");
    let mut oversized = BODY.to_vec();
    oversized.extend_from_slice(b"??");
    fs::write(&target, &oversized)?;

    fx.mount_head("f.osm.pbf", BODY.len());

    let dl = download_from(&fx.url("f.osm.pbf"), &*target, &fx.server.uri());
    assert!(matches!(dl.error(), Some(PlanetError::CorruptTooLarge)));
    // The file is left alone for the caller to inspect.
    assert_eq!(fs::read(&target)?, oversized);
    Ok(())
}

#[test]
fn an_oversized_server_response_fails_every_reader() -> Result<()> {
    let fx = Fixture::new();
    fx.mount_head("f.osm.pbf", 4);
    fx.mount(
        Mock::given(method("GET"))
            .and(path("/f.osm.pbf"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(BODY)),
    );

    let target = fx.target("f.osm.pbf");
    let dl = download_from(&fx.url("f.osm.pbf"), &*target, &fx.server.uri());
    let mut reader = dl.reader();

    let err = reader
        .read_to_end(&mut Vec::new())
        .expect_err("tail reader should fail with the download");
    assert!(err.to_string().contains("too much data"));
    assert!(matches!(dl.error(), Some(PlanetError::CorruptTooLarge)));
    Ok(())
}

#[test]
fn a_reader_created_before_the_head_streams_the_whole_file() -> Result<()> {
    let fx = Fixture::new();
    fx.mount(
        Mock::given(method("HEAD"))
            .and(path("/f.osm.pbf"))
            .respond_with(head_response(BODY.len()).set_delay(Duration::from_millis(150))),
    );
    fx.mount(
        Mock::given(method("GET"))
            .and(path("/f.osm.pbf"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(BODY)),
    );

    let target = fx.target("f.osm.pbf");
    let dl = download_from(&fx.url("f.osm.pbf"), &*target, &fx.server.uri());

    // No path has been published yet; this blocks until the HEAD lands,
    // then tails the file to its very end. At no point does it see a
    // premature EOF.
    let mut contents = Vec::new();
    dl.reader().read_to_end(&mut contents)?;
    assert_eq!(contents, BODY);
    assert!(dl.error().is_none());
    Ok(())
}

#[test]
fn stop_is_idempotent() -> Result<()> {
    let fx = Fixture::new();
    fx.mount(
        Mock::given(method("HEAD"))
            .and(path("/f.osm.pbf"))
            .respond_with(head_response(BODY.len()).set_delay(Duration::from_millis(300))),
    );
    fx.mount(
        Mock::given(method("GET"))
            .and(path("/f.osm.pbf"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(BODY)),
    );

    let target = fx.target("f.osm.pbf");
    let dl = download_from(&fx.url("f.osm.pbf"), &*target, &fx.server.uri());
    dl.stop();
    dl.stop();
    assert!(matches!(dl.error(), Some(PlanetError::Stopped)));
    // Terminal state is stable: stopping again changes nothing.
    dl.stop();
    assert!(matches!(dl.error(), Some(PlanetError::Stopped)));

    let err = dl
        .reader()
        .read_to_end(&mut Vec::new())
        .expect_err("readers see the stop");
    assert!(err.to_string().contains("stopped"));
    Ok(())
}

#[test]
fn a_failed_head_reports_the_status() -> Result<()> {
    let fx = Fixture::new();
    fx.mount(
        Mock::given(method("HEAD"))
            .and(path("/missing.osm.pbf"))
            .respond_with(ResponseTemplate::new(404)),
    );

    let target = fx.target("missing.osm.pbf");
    let dl = download_from(&fx.url("missing.osm.pbf"), &*target, &fx.server.uri());
    assert!(matches!(dl.error(), Some(PlanetError::HttpStatus(404))));
    Ok(())
}

#[test]
fn planet_file_sizes_come_from_the_primary() -> Result<()> {
    let fx = Fixture::new();
    let primary_rt = Runtime::new()?;
    let primary = primary_rt.block_on(MockServer::start());

    // Only the primary knows the size; the mirror serves the bytes. A HEAD
    // against the mirror would 404 and fail the test.
    primary_rt.block_on(
        Mock::given(method("HEAD"))
            .and(path("/planet-250106.osm.pbf"))
            .respond_with(head_response(BODY.len()))
            .mount(&primary),
    );
    fx.mount(
        Mock::given(method("GET"))
            .and(path("/planet-250106.osm.pbf"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(BODY)),
    );

    let target = fx.target("planet-250106.osm.pbf");
    let dl = download_from(
        &fx.url("planet-250106.osm.pbf"),
        &*target,
        &format!("{}/", primary.uri()),
    );
    assert!(dl.error().is_none());
    assert_eq!(fs::read(&target)?, BODY);
    Ok(())
}

#[test]
fn mirrors_are_probed_in_parallel_and_sorted() -> Result<()> {
    let rt = Runtime::new()?;
    let good_a = rt.block_on(MockServer::start());
    let good_b = rt.block_on(MockServer::start());
    let bad = rt.block_on(MockServer::start());
    for server in [&good_a, &good_b] {
        rt.block_on(
            Mock::given(method("HEAD"))
                .and(path("/planet-250106.osm.pbf"))
                .respond_with(ResponseTemplate::new(200))
                .mount(server),
        );
    }
    rt.block_on(
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&bad),
    );

    let bases: Vec<String> = [&good_a, &good_b, &bad]
        .iter()
        .map(|s| format!("{}/", s.uri()))
        .collect();
    let candidates: Vec<&str> = bases.iter().map(String::as_str).collect();

    let found = mirrors_from("planet-250106.osm.pbf", &candidates)?;
    let mut expected = vec![bases[0].clone(), bases[1].clone()];
    expected.sort();
    assert_eq!(found, expected);

    let none = mirrors_from("planet-999999.osm.pbf", &[candidates[2]]);
    assert!(matches!(none, Err(PlanetError::NoMirrors)));
    Ok(())
}

#[test]
fn latest_names_come_back_newest_first() -> Result<()> {
    let rt = Runtime::new()?;
    let server = rt.block_on(MockServer::start());
    let page = concat!(
        "<html><body>",
        r#"<a href="planet-241230.osm.pbf">old</a>"#,
        r#"<a href="planet-250106.osm.pbf">new</a>"#,
        r#"<a href="planet-latest.osm.pbf">alias</a>"#,
        r#"<a href="CHANGELOG.txt">notes</a>"#,
        "</body></html>",
    );
    rt.block_on(
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(page))
            .mount(&server),
    );

    let names = latest_from(&format!("{}/", server.uri()))?;
    assert_eq!(names, ["planet-250106.osm.pbf", "planet-241230.osm.pbf"]);

    let empty_rt = Runtime::new()?;
    let empty = empty_rt.block_on(MockServer::start());
    empty_rt.block_on(
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html></html>"))
            .mount(&empty),
    );
    assert!(matches!(
        latest_from(&format!("{}/", empty.uri())),
        Err(PlanetError::NoNames)
    ));
    Ok(())
}
