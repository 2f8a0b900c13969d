//! Sessions opened from reference descriptors that point into a local blob.

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use nwb_stream::container::Codec;
use nwb_stream::locator::Strategy;
use nwb_stream::nwb::Substructure;
use nwb_stream::remote::DiskCache;
use nwb_stream::{Config, Error, Session};
use serde_json::{json, Value};
use url::Url;

fn f64_bytes(values: &[f64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn i64_bytes(values: &[i64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn b64(bytes: &[u8]) -> String {
    format!("base64:{}", STANDARD.encode(bytes))
}

fn array(shape: usize, dtype: &str) -> Value {
    json!({"zarr_format": 2, "shape": [shape], "chunks": [shape], "dtype": dtype, "order": "C"})
}

/// Blob with the spike times at 0 and zlib start times right after.
fn write_blob(dir: &Path) -> (String, u64) {
    let mut blob = f64_bytes(&[1.2, 0.1, 0.5, 0.3]);
    let starts = Codec::Zlib.encode(&f64_bytes(&[0.0, 2.0])).unwrap();
    let starts_len = starts.len() as u64;
    blob.extend_from_slice(&starts);
    let path = dir.join("sub-01_ses-1.nwb");
    std::fs::write(&path, blob).unwrap();
    (Url::from_file_path(&path).unwrap().to_string(), starts_len)
}

fn manifest(blob_url: &str, starts_len: u64) -> Value {
    let mut start_time = array(2, "<f8");
    start_time["compressor"] = json!({"id": "zlib", "level": 6});
    let mut direction = array(2, "|O");
    direction["filters"] = json!([{"id": "json2"}]);
    let mut identifier = array(1, "|O");
    identifier["filters"] = json!([{"id": "json2"}]);
    let mut waveform = array(2, "<f4");
    waveform["compressor"] = json!({"id": "blosc", "cname": "lz4"});

    json!({
        "version": 1,
        "templates": {"blob": blob_url},
        "refs": {
            ".zgroup": {"zarr_format": 2},
            ".zattrs": {"nwb_version": "2.7.0", "neurodata_type": "NWBFile"},
            "identifier/.zarray": identifier,
            "identifier/0": "[\"session-1\",\"|O\",[1]]",

            "units/.zgroup": {"zarr_format": 2},
            "units/.zattrs": {
                "neurodata_type": "Units",
                "colnames": ["spike_times", "waveform"]
            },
            "units/spike_times/.zarray": array(4, "<f8"),
            "units/spike_times/0": ["{{blob}}", 0, 32],
            "units/spike_times_index/.zarray": array(2, "<i8"),
            "units/spike_times_index/0": b64(&i64_bytes(&[3, 4])),
            "units/id/.zarray": array(2, "<i8"),
            "units/id/0": b64(&i64_bytes(&[0, 1])),
            "units/waveform/.zarray": waveform,
            "units/waveform/0": b64(&[0u8; 8]),

            "intervals/.zgroup": {"zarr_format": 2},
            "intervals/trials/.zgroup": {"zarr_format": 2},
            "intervals/trials/.zattrs": {
                "neurodata_type": "TimeIntervals",
                "colnames": ["start_time", "stop_time", "direction"]
            },
            "intervals/trials/start_time/.zarray": start_time,
            "intervals/trials/start_time/0": ["{{blob}}", 32, starts_len],
            "intervals/trials/stop_time/.zarray": array(2, "<f8"),
            "intervals/trials/stop_time/0": b64(&f64_bytes(&[1.0, 3.0])),
            "intervals/trials/direction/.zarray": direction,
            "intervals/trials/direction/0": "[\"left\",\"right\",\"|O\",[2]]"
        }
    })
}

fn write_manifest(dir: &Path, doc: &Value) -> PathBuf {
    let path = dir.join("nwb.lindi.json");
    std::fs::write(&path, serde_json::to_vec_pretty(doc).unwrap()).unwrap();
    path
}

fn open_sample(dir: &Path, config: &Config) -> (Session, String) {
    let (blob_url, starts_len) = write_blob(dir);
    let path = write_manifest(dir, &manifest(&blob_url, starts_len));
    let session = Session::open(path.to_str().unwrap(), config).unwrap();
    (session, blob_url)
}

#[test]
fn test_reference_strategy() {
    let dir = tempfile::tempdir().unwrap();
    let (session, _) = open_sample(dir.path(), &Config::default().without_cache());
    assert_eq!(session.strategy(), Strategy::Reference);
    assert_eq!(session.file().format_name(), "reference");

    let meta = session.nwb().metadata().unwrap();
    assert_eq!(meta.nwb_version.as_deref(), Some("2.7.0"));
    assert_eq!(meta.identifier.as_deref(), Some("session-1"));
}

#[test]
fn test_units_through_ranges() {
    let dir = tempfile::tempdir().unwrap();
    let (session, _) = open_sample(dir.path(), &Config::default().without_cache());

    let units = session.nwb().units().unwrap();
    assert_eq!(units.get(0), Some(&[0.1, 0.5, 1.2][..]));
    assert_eq!(units.get(1), Some(&[0.3][..]));
    // blosc is not decodable here, so the column is reported instead of read
    assert_eq!(units.skipped_columns(), &["waveform".to_string()]);
    assert!(units.column("waveform").is_none());
}

#[test]
fn test_trials_through_compressed_range() {
    let dir = tempfile::tempdir().unwrap();
    let (session, _) = open_sample(dir.path(), &Config::default().without_cache());

    let trials = session.nwb().trials().unwrap();
    assert_eq!(trials.intervals(), &[(0.0, 1.0), (2.0, 3.0)]);
    assert_eq!(trials.ids(), &[0, 1]);
    assert_eq!(
        trials.column("direction").unwrap().as_text().unwrap(),
        &["left", "right"]
    );
    assert!(matches!(
        session.nwb().intervals(&Substructure::Epochs),
        Err(Error::MissingSubstructure(_))
    ));
}

#[test]
fn test_file_url_locator() {
    let dir = tempfile::tempdir().unwrap();
    let (blob_url, starts_len) = write_blob(dir.path());
    let path = write_manifest(dir.path(), &manifest(&blob_url, starts_len));
    let url = Url::from_file_path(&path).unwrap().to_string();

    let session = Session::open(&url, &Config::default().without_cache()).unwrap();
    assert_eq!(session.strategy(), Strategy::Reference);
    assert_eq!(session.nwb().units().unwrap().len(), 2);
}

#[test]
fn test_blob_ranges_cached() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        block_size: 0,
        ..Config::default().with_cache_dir(dir.path().join("cache"))
    };
    let (session, blob_url) = open_sample(dir.path(), &config);
    let expected = session.nwb().units().unwrap();
    drop(session);

    let cache = DiskCache::open(dir.path().join("cache")).unwrap();
    assert!(cache.entry_count(&blob_url).unwrap() > 0);

    let path = dir.path().join("nwb.lindi.json");
    let again = Session::open(path.to_str().unwrap(), &config).unwrap();
    assert_eq!(again.nwb().units().unwrap().as_map(), expected.as_map());
    let blob = again.store().reader(&blob_url).unwrap();
    assert!(blob.hits() > 0);
    assert_eq!(blob.misses(), 0);
}

#[test]
fn test_unreachable_chunk_surfaces() {
    let dir = tempfile::tempdir().unwrap();
    let doc = json!({"refs": {
        ".zgroup": {"zarr_format": 2},
        "units/.zgroup": {"zarr_format": 2},
        "units/spike_times/.zarray": array(4, "<f8"),
        "units/spike_times/0": ["http://127.0.0.1:1/blob.nwb", 0, 32]
    }});
    let path = write_manifest(dir.path(), &doc);
    let config = Config {
        timeout_secs: 5,
        ..Config::default().without_cache()
    };

    // Navigation only needs the manifest
    let session = Session::open(path.to_str().unwrap(), &config).unwrap();
    assert!(session.nwb().has(&Substructure::Units).unwrap());
    let err = session.nwb().units().unwrap_err();
    assert!(matches!(err, Error::RemoteFetch { .. }), "{err:?}");
}

#[test]
fn test_malformed_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nwb.lindi.json");
    std::fs::write(&path, b"{\"refs\": [1, 2").unwrap();
    let err = Session::open(path.to_str().unwrap(), &Config::default().without_cache()).unwrap_err();
    assert!(matches!(err, Error::MalformedContainer(_)), "{err:?}");
}
