use std::io::Write;
use std::net::TcpListener;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;

use assert_cmd::cargo::CommandCargoExt;
use reqwest::blocking::Client;
use reqwest::redirect::Policy;
use reqwest::StatusCode;
use serde_json::{json, Value};
use tempfile::TempDir;

struct TestDaemon {
    base_url: String,
    child: Child,
    _extensions: TempDir,
}

impl TestDaemon {
    /// Seed the reference corpus into a temp directory with the
    /// `add` subcommand, then spawn `server` against it.
    fn spawn() -> Self {
        Self::spawn_with(&[])
    }

    fn spawn_with(extra_args: &[&str]) -> Self {
        let extensions = tempfile::tempdir().expect("tempdir for extensions");
        seed_corpus(extensions.path());

        // Bind an ephemeral port first so we know which port to pass
        // to the `server` subcommand.
        let listener =
            TcpListener::bind("127.0.0.1:0").expect("bind ephemeral TCP listener for daemon");
        let port = listener
            .local_addr()
            .expect("local_addr for daemon listener")
            .port();
        drop(listener);

        let addr_arg = format!("127.0.0.1:{port}");
        let base_url = format!("http://{addr_arg}");

        let mut cmd = Command::cargo_bin("vsix-gallery").expect("locate vsix-gallery binary");
        cmd.args([
            "server",
            "--extensions-dir",
            extensions.path().to_str().expect("utf8 tempdir"),
            "--address",
            &addr_arg,
        ])
        .args(extra_args)
        .stdout(Stdio::null())
        .stderr(Stdio::null());
        let child = cmd.spawn().expect("spawn vsix-gallery server daemon");

        wait_for_health(&base_url);

        Self {
            base_url,
            child,
            _extensions: extensions,
        }
    }

    fn query(&self, body: &Value) -> (StatusCode, Value) {
        let response = Client::new()
            .post(format!("{}/api/extensionquery", self.base_url))
            .json(body)
            .send()
            .expect("send extension query");
        let status = response.status();
        let value = response.json().expect("decode query response");
        (status, value)
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn wait_for_health(base_url: &str) {
    let client = Client::new();
    let url = format!("{base_url}/healthz");

    for _ in 0..150 {
        match client.get(&url).send() {
            Ok(resp) if resp.status().is_success() => return,
            _ => thread::sleep(Duration::from_millis(100)),
        }
    }
    panic!("vsix-gallery server did not become healthy in time");
}

/// Build a minimal VSIX archive in memory.
fn build_vsix(
    publisher: &str,
    name: &str,
    version: &str,
    description: &str,
    tags: &str,
    categories: &str,
) -> Vec<u8> {
    let manifest = format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<PackageManifest Version="2.0.0" xmlns="http://schemas.microsoft.com/developer/vsx-schema/2011">
  <Metadata>
    <Identity Language="en-US" Id="{name}" Version="{version}" Publisher="{publisher}" />
    <DisplayName>{name}</DisplayName>
    <Description xml:space="preserve">{description}</Description>
    <Tags>{tags}</Tags>
    <Categories>{categories}</Categories>
    <GalleryFlags>Public</GalleryFlags>
    <Properties>
      <Property Id="Microsoft.VisualStudio.Code.Engine" Value="^1.57.0" />
    </Properties>
  </Metadata>
  <Installation>
    <InstallationTarget Id="Microsoft.VisualStudio.Code" />
  </Installation>
  <Assets>
    <Asset Type="Microsoft.VisualStudio.Code.Manifest" Path="extension/package.json" Addressable="true" />
  </Assets>
</PackageManifest>"#
    );

    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    writer
        .start_file("extension.vsixmanifest", options)
        .expect("start manifest entry");
    writer
        .write_all(manifest.as_bytes())
        .expect("write manifest entry");
    writer
        .start_file("extension/package.json", options)
        .expect("start package.json entry");
    writer
        .write_all(format!(r#"{{"name":"{name}","version":"{version}"}}"#).as_bytes())
        .expect("write package.json entry");
    writer.finish().expect("finish vsix").into_inner()
}

fn seed_corpus(extensions_dir: &Path) {
    let corpus: &[(&str, &str, &str, &str, &str, &[&str])] = &[
        (
            "foo",
            "zany",
            "foo bar baz qux",
            "tag1",
            "cat1",
            &["3.0.0", "2.2.2", "2.0.0", "1.5.2", "1.0.0"],
        ),
        (
            "foo",
            "buz",
            "quix baz bar buz sitting",
            "tag2",
            "cat2",
            &["1.0.0"],
        ),
        (
            "bar",
            "squigly",
            "squigly foo and more foo bar baz",
            "tag1,tag2",
            "cat1",
            &["1.0.0"],
        ),
        (
            "fred",
            "thud",
            "frobbles the frobnozzle",
            "tag3,tag4,tag5",
            "cat2",
            &["1.0.0"],
        ),
        (
            "qqqqqqqqqqq",
            "qqqqq",
            "qqqqqqqqqqqqqqqqqqq",
            "qq,qqq,qqqq",
            "cat3",
            &["1.0.0"],
        ),
    ];

    let staging = tempfile::tempdir().expect("tempdir for vsix staging");
    for (publisher, name, description, tags, categories, versions) in corpus {
        for version in *versions {
            let vsix = build_vsix(publisher, name, version, description, tags, categories);
            let path = staging
                .path()
                .join(format!("{publisher}.{name}-{version}.vsix"));
            std::fs::write(&path, vsix).expect("write vsix to staging");

            Command::cargo_bin("vsix-gallery")
                .expect("locate vsix-gallery binary")
                .args([
                    "add",
                    path.to_str().expect("utf8 staging path"),
                    "--extensions-dir",
                    extensions_dir.to_str().expect("utf8 extensions dir"),
                ])
                .output()
                .map(|output| assert!(output.status.success(), "add failed: {output:?}"))
                .expect("run add");
        }
    }
}

fn target_query(page_size: i64) -> Value {
    json!({
        "filters": [{
            "criteria": [
                {"filterType": 8, "value": "Microsoft.VisualStudio.Code"}
            ],
            "pageSize": page_size,
        }],
        "flags": 0,
    })
}

fn result_ids(response: &Value) -> Vec<String> {
    response["results"][0]["extensions"]
        .as_array()
        .expect("extensions array")
        .iter()
        .map(|e| e["extensionId"].as_str().expect("extensionId").to_string())
        .collect()
}

fn total_count(response: &Value) -> i64 {
    response["results"][0]["resultMetadata"][0]["metadataItems"][0]["count"]
        .as_i64()
        .expect("TotalCount")
}

#[test]
fn target_filter_returns_the_whole_corpus_in_relevance_order() {
    let daemon = TestDaemon::spawn();
    let (status, response) = daemon.query(&target_query(50));
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        result_ids(&response),
        vec![
            "foo.buz",
            "qqqqqqqqqqq.qqqqq",
            "bar.squigly",
            "fred.thud",
            "foo.zany",
        ]
    );
    assert_eq!(total_count(&response), 5);
}

#[test]
fn search_text_narrows_and_ranks() {
    let daemon = TestDaemon::spawn();

    let (status, response) = daemon.query(&json!({
        "filters": [{
            "criteria": [{"filterType": 10, "value": "foo bar baz qux zany"}],
        }],
    }));
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result_ids(&response), vec!["foo.zany"]);

    let (_, response) = daemon.query(&json!({
        "filters": [{
            "criteria": [{"filterType": 10, "value": "qux"}],
        }],
    }));
    assert_eq!(result_ids(&response), vec!["foo.zany", "foo.buz"]);
}

#[test]
fn latest_version_enrichment_with_files_and_asset_uri() {
    let daemon = TestDaemon::spawn();
    // IncludeFiles | IncludeAssetURI | IncludeLatestVersionOnly
    let (status, response) = daemon.query(&json!({
        "filters": [{
            "criteria": [{"filterType": 4, "value": "foo.zany"}],
        }],
        "flags": 0x2 | 0x80 | 0x200,
    }));
    assert_eq!(status, StatusCode::OK);

    let extensions = response["results"][0]["extensions"]
        .as_array()
        .expect("extensions");
    assert_eq!(extensions.len(), 1);
    let versions = extensions[0]["versions"].as_array().expect("versions");
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0]["version"], "3.0.0");

    let asset_uri = versions[0]["assetUri"].as_str().expect("assetUri");
    assert_eq!(
        asset_uri,
        format!("{}/assets/foo/zany/3.0.0", daemon.base_url)
    );
    assert_eq!(versions[0]["assetUri"], versions[0]["fallbackAssetUri"]);

    let files = versions[0]["files"].as_array().expect("files");
    let package = files
        .iter()
        .find(|f| f["assetType"] == "Microsoft.VisualStudio.Services.VSIXPackage")
        .expect("synthetic VSIXPackage file");
    assert_eq!(
        package["source"],
        format!(
            "{}/files/foo/zany/3.0.0/foo.zany-3.0.0.vsix",
            daemon.base_url
        )
    );
}

#[test]
fn vspackage_asset_redirects_to_the_stored_archive() {
    let daemon = TestDaemon::spawn();
    let client = Client::builder()
        .redirect(Policy::none())
        .build()
        .expect("build client");

    let response = client
        .get(format!("{}/assets/foo/zany/3.0.0/vspackage", daemon.base_url))
        .send()
        .expect("request asset");
    assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
    let location = response.headers()["location"]
        .to_str()
        .expect("location header");
    assert_eq!(
        location,
        format!(
            "{}/files/foo/zany/3.0.0/foo.zany-3.0.0.vsix",
            daemon.base_url
        )
    );

    // Following the redirect serves the actual archive bytes.
    let archive = client.get(location).send().expect("download archive");
    assert_eq!(archive.status(), StatusCode::OK);
    let bytes = archive.bytes().expect("archive bytes");
    assert_eq!(&bytes[..2], b"PK", "zip magic");
}

#[test]
fn vspackage_path_routes_serve_the_same_redirect() {
    let daemon = TestDaemon::spawn();
    let client = Client::builder()
        .redirect(Policy::none())
        .build()
        .expect("build client");

    for prefix in ["", "/api"] {
        let response = client
            .get(format!(
                "{}{prefix}/publishers/foo/vsextensions/zany/3.0.0/vspackage",
                daemon.base_url
            ))
            .send()
            .expect("request vspackage");
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
    }
}

#[test]
fn oversized_page_size_is_rejected() {
    let daemon = TestDaemon::spawn();
    let (status, response) = daemon.query(&target_query(500));
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let detail = response["detail"].as_str().expect("detail");
    assert!(detail.contains("page size"), "detail: {detail}");
    assert!(detail.contains("200"), "detail: {detail}");
    assert!(
        !response["requestId"].as_str().expect("requestId").is_empty(),
        "error envelopes carry the request id"
    );
}

#[test]
fn malformed_query_body_is_rejected() {
    let daemon = TestDaemon::spawn();
    let response = Client::new()
        .post(format!("{}/api/extensionquery", daemon.base_url))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .expect("send malformed query");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let value: Value = response.json().expect("error envelope");
    assert_eq!(value["message"], "Unable to read query");
}

#[test]
fn unknown_asset_is_a_404() {
    let daemon = TestDaemon::spawn();
    let client = Client::builder()
        .redirect(Policy::none())
        .build()
        .expect("build client");
    let response = client
        .get(format!(
            "{}/assets/foo/nonexistent/1.0.0/vspackage",
            daemon.base_url
        ))
        .send()
        .expect("request asset");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[test]
fn forwarded_header_controls_emitted_urls() {
    let daemon = TestDaemon::spawn();
    let response = Client::new()
        .post(format!("{}/api/extensionquery", daemon.base_url))
        .header("Forwarded", "host=gallery.example;proto=https")
        .json(&json!({
            "filters": [{
                "criteria": [{"filterType": 4, "value": "foo.zany"}],
            }],
            "flags": 0x80 | 0x200,
        }))
        .send()
        .expect("send query");
    let value: Value = response.json().expect("response");
    let asset_uri = value["results"][0]["extensions"][0]["versions"][0]["assetUri"]
        .as_str()
        .expect("assetUri");
    assert_eq!(asset_uri, "https://gallery.example/assets/foo/zany/3.0.0");
}

#[test]
fn sort_keys_and_order_are_honored() {
    let daemon = TestDaemon::spawn();

    // Title, descending by default.
    let (_, response) = daemon.query(&json!({
        "filters": [{
            "criteria": [{"filterType": 8, "value": "Microsoft.VisualStudio.Code"}],
            "sortBy": 2,
        }],
    }));
    assert_eq!(
        result_ids(&response),
        vec![
            "foo.buz",
            "qqqqqqqqqqq.qqqqq",
            "bar.squigly",
            "fred.thud",
            "foo.zany",
        ]
    );

    // Publisher name, inverted by sortOrder = Ascending.
    let (_, response) = daemon.query(&json!({
        "filters": [{
            "criteria": [{"filterType": 8, "value": "Microsoft.VisualStudio.Code"}],
            "sortBy": 3,
            "sortOrder": 1,
        }],
    }));
    assert_eq!(
        result_ids(&response),
        vec![
            "qqqqqqqqqqq.qqqqq",
            "fred.thud",
            "foo.zany",
            "foo.buz",
            "bar.squigly",
        ]
    );
}

#[test]
fn pagination_over_http() {
    let daemon = TestDaemon::spawn();
    let (_, response) = daemon.query(&json!({
        "filters": [{
            "criteria": [{"filterType": 8, "value": "Microsoft.VisualStudio.Code"}],
            "pageNumber": 2,
            "pageSize": 2,
        }],
    }));
    assert_eq!(result_ids(&response), vec!["bar.squigly", "fred.thud"]);
    assert_eq!(total_count(&response), 5);
}

#[test]
fn version_properties_round_trip() {
    let daemon = TestDaemon::spawn();
    // IncludeVersions | IncludeVersionProperties
    let (_, response) = daemon.query(&json!({
        "filters": [{
            "criteria": [{"filterType": 4, "value": "foo.zany"}],
        }],
        "flags": 0x1 | 0x10,
    }));

    let versions = response["results"][0]["extensions"][0]["versions"]
        .as_array()
        .expect("versions");
    assert_eq!(versions.len(), 5);
    let version_names: Vec<&str> = versions
        .iter()
        .map(|v| v["version"].as_str().expect("version"))
        .collect();
    assert_eq!(
        version_names,
        vec!["3.0.0", "2.2.2", "2.0.0", "1.5.2", "1.0.0"]
    );

    let properties = versions[0]["properties"].as_array().expect("properties");
    assert!(properties
        .iter()
        .any(|p| p["key"] == "Microsoft.VisualStudio.Code.Engine" && p["value"] == "^1.57.0"));
}

#[test]
fn responses_carry_a_request_id_header() {
    let daemon = TestDaemon::spawn();
    let response = Client::new()
        .get(format!("{}/healthz", daemon.base_url))
        .send()
        .expect("request healthz");
    assert!(
        response.headers().contains_key("x-request-id"),
        "x-request-id header missing"
    );
}

#[test]
fn unknown_file_paths_are_404() {
    let daemon = TestDaemon::spawn();
    let response = Client::new()
        .get(format!(
            "{}/files/foo/zany/3.0.0/no/such/file.txt",
            daemon.base_url
        ))
        .send()
        .expect("request missing file");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[test]
fn rate_limit_kicks_in_per_endpoint() {
    let daemon = TestDaemon::spawn_with(&["--rate-limit", "3"]);
    let client = Client::new();

    let url = format!("{}/healthz", daemon.base_url);
    let mut statuses = Vec::new();
    // The health poll in spawn already consumed part of the budget,
    // so just drive the endpoint until the limiter trips.
    for _ in 0..6 {
        statuses.push(client.get(&url).send().expect("request healthz").status());
    }
    assert!(
        statuses.contains(&StatusCode::TOO_MANY_REQUESTS),
        "expected a 429 after exceeding the limit: {statuses:?}"
    );

    // Other endpoints budget independently.
    let response = client
        .get(format!("{}/item", daemon.base_url))
        .send()
        .expect("request item");
    assert_eq!(response.status(), StatusCode::OK);
}

#[test]
fn informational_endpoints_answer_in_plaintext() {
    let daemon = TestDaemon::spawn();
    let client = Client::new();

    let root = client
        .get(&daemon.base_url)
        .send()
        .expect("request index");
    assert_eq!(root.status(), StatusCode::OK);
    assert!(root.text().expect("index body").contains("Marketplace"));

    let item = client
        .get(format!("{}/item?itemName=foo.zany", daemon.base_url))
        .send()
        .expect("request item page");
    assert!(item.text().expect("item body").contains("foo.zany"));

    let stub = client
        .post(format!(
            "{}/api/itemName/foo.zany/version/3.0.0/vscodewebextension",
            daemon.base_url
        ))
        .send()
        .expect("post web extension stub");
    assert_eq!(stub.status(), StatusCode::OK);
}
