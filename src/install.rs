use std::{fs, io::Write as _, path::Path};

use anyhow::Context as _;
use futures_util::StreamExt as _;
use tracing::info;

use crate::util::{chmod, tmp_path_next_to};

pub const RELEASE_BASE_URL: &str = "https://github.com/XTLS/Xray-core/releases/latest/download";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuArch {
    X86_64,
    Aarch64,
    Other(&'static str),
}

pub fn detect_cpu_arch() -> CpuArch {
    match std::env::consts::ARCH {
        "x86_64" => CpuArch::X86_64,
        "aarch64" => CpuArch::Aarch64,
        other => CpuArch::Other(other),
    }
}

pub fn asset_name(arch: CpuArch) -> anyhow::Result<&'static str> {
    match arch {
        CpuArch::X86_64 => Ok("xray-linux-64.zip"),
        CpuArch::Aarch64 => Ok("xray-linux-arm64-v8a.zip"),
        CpuArch::Other(name) => anyhow::bail!("no xray release for cpu arch: {name}"),
    }
}

/// Downloads the release archive for `arch` from `base_url` and installs its `xray` binary at
/// `dest` with mode 0755.
pub async fn install_engine(base_url: &str, arch: CpuArch, dest: &Path) -> anyhow::Result<()> {
    let asset = asset_name(arch)?;
    let url = format!("{}/{asset}", base_url.trim_end_matches('/'));

    let zip_path = tmp_path_next_to(&dest.with_file_name(asset));
    let result = async {
        download_to_path(&url, &zip_path)
            .await
            .with_context(|| format!("download {url}"))?;
        extract_xray_binary_from_zip_to_path(&zip_path, dest)
            .with_context(|| format!("extract {}", zip_path.display()))?;
        chmod(dest, 0o755).with_context(|| format!("chmod {}", dest.display()))
    }
    .await;
    let _ = fs::remove_file(&zip_path);
    result?;

    info!(dest = %dest.display(), asset, "engine installed");
    Ok(())
}

async fn download_to_path(url: &str, dest: &Path) -> anyhow::Result<()> {
    let client = reqwest::Client::builder()
        .user_agent(concat!("nodeprobe/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("build http client")?;
    let resp = client.get(url).send().await?.error_for_status()?;
    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::File::create(dest)?;
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let buf = chunk?;
        file.write_all(&buf)?;
    }
    file.flush()?;
    Ok(())
}

fn extract_xray_binary_from_zip_to_path(zip_path: &Path, dest: &Path) -> anyhow::Result<()> {
    let f = fs::File::open(zip_path)?;
    let mut archive = zip::ZipArchive::new(f)?;

    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        if file.is_dir() {
            continue;
        }
        let name = file.name().replace('\\', "/");
        if name.ends_with("/xray") || name == "xray" {
            if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            let tmp = tmp_path_next_to(dest);
            let mut out = fs::File::create(&tmp)?;
            std::io::copy(&mut file, &mut out)?;
            out.flush()?;
            drop(out);
            if let Err(err) = fs::rename(&tmp, dest) {
                let _ = fs::remove_file(&tmp);
                return Err(err.into());
            }
            return Ok(());
        }
    }

    anyhow::bail!("xray binary not found in zip")
}
