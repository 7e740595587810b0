use crate::jsonsig;
use crate::ops::{Op, OpError};
use crate::proxy;
use serde::Deserialize;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Manifest responses are read to at most this many bytes.
pub const MAX_MANIFEST_BYTES: usize = 1024 * 1024;

pub const USER_AGENT: &str = "Update Check";

/// Version reported when no version file exists yet.
pub const DEFAULT_VERSION: &str = "1";

pub const VERSION_FILE: &str = ".version";
pub const RELOAD_FILE: &str = ".reload";

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct UpgradeInfo {
    #[serde(rename = "URL")]
    pub url: String,
    pub version: String,
    pub sha1: String,
    pub sha256: String,
    pub operations: Vec<RawOperation>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct RawOperation {
    pub action: String,
    pub args: Vec<String>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("{0}")]
    Http(String),
    #[error("Got an error from the update url: {0}")]
    Status(u16),
    #[error("Unable to parse JSON manifest: {0}")]
    Parse(String),
    #[error("error verifying update manifest signature: {0}")]
    Signature(#[from] jsonsig::SignError),
    #[error("The upgrade URL did not provide a checksum")]
    NoChecksum,
    #[error("Download checksum failed")]
    ChecksumMismatch,
    #[error("failed to extract archive: {0}")]
    Extract(String),
    #[error("{0}")]
    Io(String),
    #[error(transparent)]
    Op(#[from] OpError),
}

// ---------------------------------------------------------------------------
// Update check
// ---------------------------------------------------------------------------

/// Ask the manifest endpoint whether an upgrade beyond `current_version`
/// exists. Returns None on 304, on a matching version, or on an empty
/// manifest URL. With a public key, the body must verify as signed JSON
/// before it is even parsed.
pub async fn check(
    client: &reqwest::Client,
    check_url: &str,
    current_version: &str,
    public_key: Option<&str>,
    profile_dir: &Path,
) -> Result<Option<UpgradeInfo>, UpdateError> {
    let encoded: String = url::form_urlencoded::byte_serialize(current_version.as_bytes()).collect();
    let mut request = client
        .get(format!("{check_url}?version={encoded}"))
        .header("User-Agent", USER_AGENT);
    for (name, value) in crate::profile::request_headers(profile_dir) {
        request = request.header(name.as_str(), value);
    }

    let mut response = request.send().await.map_err(|e| UpdateError::Http(e.to_string()))?;
    let status = response.status().as_u16();
    if status == 304 {
        return Ok(None);
    }
    if status >= 400 {
        return Err(UpdateError::Status(status));
    }

    let mut body: Vec<u8> = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| UpdateError::Http(e.to_string()))?
    {
        body.extend_from_slice(&chunk);
        if body.len() > MAX_MANIFEST_BYTES {
            body.truncate(MAX_MANIFEST_BYTES);
            break;
        }
    }

    if let Some(key) = public_key
        && !key.is_empty()
    {
        jsonsig::verify(&body, key)?;
    }

    let info: UpgradeInfo =
        serde_json::from_slice(&body).map_err(|e| UpdateError::Parse(e.to_string()))?;

    if !info.version.is_empty() && info.version == current_version {
        return Ok(None);
    }

    Ok(Some(info))
}

// ---------------------------------------------------------------------------
// Upgrade
// ---------------------------------------------------------------------------

pub struct UpdateOptions {
    pub install_root: PathBuf,
    pub version_file: String,
    pub override_version: Option<String>,
    pub public_key: Option<String>,
    pub profile_dir: PathBuf,
}

impl UpdateOptions {
    pub fn new(install_root: impl Into<PathBuf>) -> Self {
        let install_root = install_root.into();
        Self {
            profile_dir: install_root.clone(),
            install_root,
            version_file: VERSION_FILE.to_string(),
            override_version: None,
            public_key: None,
        }
    }

    fn version_path(&self) -> PathBuf {
        self.install_root.join(&self.version_file)
    }
}

/// Check, download, verify, extract, run the operation list, then stamp
/// `.version` (trailing newline) and touch `.reload`.
///
/// The version stamp is written last: a crash mid-apply leaves the old
/// version string in place so the next check retries the same upgrade.
pub async fn upgrade_if_required(
    check_url: &str,
    opts: &UpdateOptions,
) -> Result<bool, UpdateError> {
    let version_path = opts.version_path();
    let mut current = read_current_version(&version_path);
    if let Some(v) = &opts.override_version
        && !v.is_empty()
    {
        current = v.clone();
    }

    // The first attempt honours any configured proxy; if it fails while a
    // proxy is set, retry once with proxying disabled so a broken proxy
    // cannot block updates reachable over a direct path.
    let client = reqwest::Client::new();
    let mut result = check(
        &client,
        check_url,
        &current,
        opts.public_key.as_deref(),
        &opts.profile_dir,
    )
    .await;
    if result.is_err()
        && let Ok(proxy_url) = std::env::var(proxy::HTTP_PROXY_ENV)
        && !proxy_url.is_empty()
    {
        println!("Update check using proxy '{proxy_url}' failed. Trying again without ...");
        let direct = reqwest::Client::builder()
            .no_proxy()
            .build()
            .map_err(|e| UpdateError::Http(e.to_string()))?;
        result = check(
            &direct,
            check_url,
            &current,
            opts.public_key.as_deref(),
            &opts.profile_dir,
        )
        .await;
    }

    let Some(info) = result? else {
        return Ok(false);
    };
    if info.url.is_empty() {
        return Ok(false);
    }

    // Normalize the operation list up front so a malformed manifest aborts
    // before anything is downloaded.
    let operations: Vec<Op> = info
        .operations
        .iter()
        .map(|op| Op::parse(&op.action, &op.args))
        .collect::<Result<_, _>>()?;

    println!(
        "Downloading version {} update from {} ...",
        info.version, info.url
    );
    let archive = download(&client, &info.url).await?;
    if let Ok(meta) = archive.as_file().metadata() {
        println!("Download complete ({} bytes).", meta.len());
    }

    validate_checksum(&info, archive.path())?;

    println!("Unzipping update ...");
    extract_zip(archive.path(), &opts.install_root)?;
    println!("Unzip complete.");

    for op in &operations {
        println!("Performing operation '{op}' ...");
        op.apply(&opts.install_root)?;
    }

    std::fs::write(&version_path, format!("{}\n", info.version))
        .map_err(|e| UpdateError::Io(e.to_string()))?;
    std::fs::write(opts.install_root.join(RELOAD_FILE), "")
        .map_err(|e| UpdateError::Io(e.to_string()))?;

    Ok(true)
}

pub fn read_current_version(version_path: &Path) -> String {
    match std::fs::read_to_string(version_path) {
        Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
        _ => DEFAULT_VERSION.to_string(),
    }
}

async fn download(
    client: &reqwest::Client,
    url: &str,
) -> Result<tempfile::NamedTempFile, UpdateError> {
    let mut response = client
        .get(url)
        .send()
        .await
        .map_err(|e| UpdateError::Http(e.to_string()))?;
    if !response.status().is_success() {
        return Err(UpdateError::Status(response.status().as_u16()));
    }

    let mut file = tempfile::NamedTempFile::new().map_err(|e| UpdateError::Io(e.to_string()))?;
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| UpdateError::Http(e.to_string()))?
    {
        file.write_all(&chunk)
            .map_err(|e| UpdateError::Io(e.to_string()))?;
    }
    file.flush().map_err(|e| UpdateError::Io(e.to_string()))?;
    Ok(file)
}

// ---------------------------------------------------------------------------
// Checksum
// ---------------------------------------------------------------------------

/// Sha256 is preferred; Sha1 is accepted as a fallback for older manifests.
pub fn validate_checksum(info: &UpgradeInfo, archive: &Path) -> Result<(), UpdateError> {
    let (required, actual) = if !info.sha256.is_empty() {
        (info.sha256.to_lowercase(), file_digest::<Sha256>(archive)?)
    } else if !info.sha1.is_empty() {
        (info.sha1.to_lowercase(), file_digest::<Sha1>(archive)?)
    } else {
        return Err(UpdateError::NoChecksum);
    };

    if required != actual {
        return Err(UpdateError::ChecksumMismatch);
    }
    Ok(())
}

fn file_digest<D: Digest + Write>(path: &Path) -> Result<String, UpdateError> {
    let mut file = std::fs::File::open(path).map_err(|e| UpdateError::Io(e.to_string()))?;
    let mut hasher = D::new();
    std::io::copy(&mut file, &mut hasher).map_err(|e| UpdateError::Io(e.to_string()))?;
    Ok(hex(&hasher.finalize()))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

pub fn extract_zip(zipfile: &Path, dest: &Path) -> Result<(), UpdateError> {
    let file = std::fs::File::open(zipfile).map_err(|e| UpdateError::Io(e.to_string()))?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|e| UpdateError::Extract(e.to_string()))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| UpdateError::Extract(e.to_string()))?;
        // enclosed_name rejects paths escaping the destination.
        let Some(relative) = entry.enclosed_name() else {
            continue;
        };
        let out_path = dest.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path).map_err(|e| UpdateError::Io(e.to_string()))?;
            set_mode(&out_path, entry.unix_mode(), true);
        } else {
            if let Some(parent) = out_path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| UpdateError::Io(e.to_string()))?;
            }
            let mut out =
                std::fs::File::create(&out_path).map_err(|e| UpdateError::Io(e.to_string()))?;
            std::io::copy(&mut entry, &mut out).map_err(|e| UpdateError::Io(e.to_string()))?;
            set_mode(&out_path, entry.unix_mode(), false);
        }
    }
    Ok(())
}

/// Directory modes are OR'd with 0o111 so extracted trees stay traversable
/// regardless of how the archive was built.
#[cfg(unix)]
fn set_mode(path: &Path, mode: Option<u32>, is_dir: bool) {
    use std::os::unix::fs::PermissionsExt;
    if let Some(mode) = mode {
        let mode = if is_dir { mode | 0o111 } else { mode };
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode));
    }
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: Option<u32>, _is_dir: bool) {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = std::fs::File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for (name, data) in entries {
            if name.ends_with('/') {
                writer.add_directory(name.trim_end_matches('/'), options).unwrap();
            } else {
                writer.start_file(*name, options).unwrap();
                writer.write_all(data).unwrap();
            }
        }
        writer.finish().unwrap();
    }

    #[test]
    fn test_read_current_version_defaults_to_one() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_current_version(&dir.path().join(VERSION_FILE)), "1");
    }

    #[test]
    fn test_read_current_version_trims_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(VERSION_FILE);
        std::fs::write(&path, "7\n").unwrap();
        assert_eq!(read_current_version(&path), "7");
    }

    #[test]
    fn test_checksum_sha256_preferred() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("a.zip");
        std::fs::write(&archive, b"archive bytes").unwrap();

        let sha256 = hex(&Sha256::digest(b"archive bytes"));
        let info = UpgradeInfo {
            sha256,
            sha1: "bogus".to_string(),
            ..Default::default()
        };
        validate_checksum(&info, &archive).unwrap();
    }

    #[test]
    fn test_checksum_sha1_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("a.zip");
        std::fs::write(&archive, b"archive bytes").unwrap();

        let sha1 = hex(&Sha1::digest(b"archive bytes"));
        let info = UpgradeInfo {
            sha1,
            ..Default::default()
        };
        validate_checksum(&info, &archive).unwrap();
    }

    #[test]
    fn test_checksum_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("a.zip");
        std::fs::write(&archive, b"archive bytes").unwrap();

        let info = UpgradeInfo {
            sha256: "0".repeat(64),
            ..Default::default()
        };
        assert!(matches!(
            validate_checksum(&info, &archive),
            Err(UpdateError::ChecksumMismatch)
        ));
    }

    #[test]
    fn test_checksum_missing() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("a.zip");
        std::fs::write(&archive, b"x").unwrap();

        assert!(matches!(
            validate_checksum(&UpgradeInfo::default(), &archive),
            Err(UpdateError::NoChecksum)
        ));
    }

    #[test]
    fn test_extract_zip_contents() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("a.zip");
        write_zip(
            &archive,
            &[
                ("bin/", b""),
                ("bin/tool", b"tool bytes"),
                ("readme.txt", b"docs"),
            ],
        );

        let dest = dir.path().join("out");
        std::fs::create_dir(&dest).unwrap();
        extract_zip(&archive, &dest).unwrap();

        assert_eq!(
            std::fs::read_to_string(dest.join("bin/tool")).unwrap(),
            "tool bytes"
        );
        assert_eq!(
            std::fs::read_to_string(dest.join("readme.txt")).unwrap(),
            "docs"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_extract_zip_directories_are_traversable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("a.zip");

        let file = std::fs::File::create(&archive).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        // A directory entry stored without execute bits.
        let dir_options = zip::write::SimpleFileOptions::default().unix_permissions(0o600);
        writer.add_directory("data", dir_options).unwrap();
        writer.finish().unwrap();

        let dest = dir.path().join("out");
        std::fs::create_dir(&dest).unwrap();
        extract_zip(&archive, &dest).unwrap();

        let mode = std::fs::metadata(dest.join("data")).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111, "dir mode {mode:o} not traversable");
    }

    #[test]
    fn test_manifest_parses_wire_format() {
        let body = r#"{
            "URL": "https://example.com/v2.zip",
            "Version": "2",
            "Sha256": "abc",
            "Operations": [ { "Action": "move", "Args": ["v2-bin", "app"] } ],
            "signature": "ignored-here"
        }"#;
        let info: UpgradeInfo = serde_json::from_str(body).unwrap();
        assert_eq!(info.url, "https://example.com/v2.zip");
        assert_eq!(info.version, "2");
        assert_eq!(info.operations.len(), 1);
        assert_eq!(info.operations[0].action, "move");
    }
}
