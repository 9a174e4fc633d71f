#![cfg(feature = "cli")]
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use byteorder::{BigEndian, ByteOrder};
use clap::{ArgAction, Parser, Subcommand};
use tracing::{error, info, warn, Level};
use uuid::Uuid;

use rsdrm::clearkey::ClearKeyEngine;
use rsdrm::config::DrmConfig;
use rsdrm::crypto_info::{parse_unit, CryptoInfo, ParseContext};
use rsdrm::license::{LicenseClient, LicenseWorker};
use rsdrm::provision::ProvisioningClient;
use rsdrm::scheme::{CipherMode, DrmScheme, EsType};
use rsdrm::session::{DrmInfo, OfflineDrmInfo, SessionHandle};
use rsdrm::transport::ReqwestTransport;
use rsdrm::{DrmSessionManager, Error};

#[derive(Parser)]
#[command(name = "rsdrm", version, disable_version_flag = true, about = "rsdrm CLI")]
struct Cli {
    #[arg(short = 'v', long = "version", action = ArgAction::SetTrue)]
    version: bool,

    #[arg(short = 'd', long = "debug", action = ArgAction::SetTrue)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// CLI subcommands.
///
/// Unit files hold access units, each prefixed by its length as a
/// big-endian u32.
#[derive(Subcommand)]
enum Commands {
    /// Print the encryption metadata of every unit in a unit file.
    Inspect {
        units: PathBuf,
        #[arg(short = 's', long = "scheme", default_value = "clearkey")]
        scheme: DrmScheme,
    },
    /// Decrypt a unit file with a known key.
    Decrypt {
        units: PathBuf,
        output: PathBuf,
        /// Content key as hex.
        #[arg(short = 'k', long = "key")]
        key: String,
        /// Constant IV as hex (8 or 16 bytes), used when units carry none.
        #[arg(short = 'i', long = "iv")]
        iv: String,
        /// aes-ctr, aes-cbc, sm4-ctr or sm4-cbc.
        #[arg(short = 'm', long = "mode")]
        mode: CipherMode,
        /// Only decrypt units naming this key id.
        #[arg(long = "kid")]
        kid: Option<Uuid>,
        #[arg(short = 's', long = "scheme", default_value = "clearkey")]
        scheme: DrmScheme,
    },
    /// Provision and acquire a license using a configuration file.
    License {
        config: PathBuf,
        #[arg(long = "kid", required = true)]
        kids: Vec<Uuid>,
    },
    /// Decrypt a unit file online, following key rotations.
    Play {
        config: PathBuf,
        units: PathBuf,
        output: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.debug {
        Level::DEBUG
    } else {
        Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .init();

    info!("rsdrm version {}", env!("CARGO_PKG_VERSION"));

    if cli.version {
        return Ok(());
    }

    match cli.command {
        Some(Commands::Inspect { units, scheme }) => run_inspect(&units, scheme),
        Some(Commands::Decrypt {
            units,
            output,
            key,
            iv,
            mode,
            kid,
            scheme,
        }) => run_decrypt(&units, &output, &key, &iv, mode, kid, scheme),
        Some(Commands::License { config, kids }) => run_license(&config, kids),
        Some(Commands::Play {
            config,
            units,
            output,
        }) => run_play(&config, &units, &output),
        None => Ok(()),
    }
}

fn read_units(path: &Path) -> anyhow::Result<Vec<Vec<u8>>> {
    let data = std::fs::read(path).context("Failed to read unit file")?;
    let mut units = Vec::new();
    let mut pos = 0usize;
    while pos < data.len() {
        if data.len() - pos < 4 {
            anyhow::bail!("Unit file ends inside a length prefix at offset {}", pos);
        }
        let len = BigEndian::read_u32(&data[pos..pos + 4]) as usize;
        pos += 4;
        if data.len() - pos < len {
            anyhow::bail!("Unit at offset {} claims {} bytes, {} left", pos, len, data.len() - pos);
        }
        units.push(data[pos..pos + len].to_vec());
        pos += len;
    }
    Ok(units)
}

fn parse_iv(value: &str) -> anyhow::Result<[u8; 16]> {
    let bytes = hex::decode(value).context("IV is not valid hex")?;
    if bytes.len() != 8 && bytes.len() != 16 {
        anyhow::bail!("IV must be 8 or 16 bytes, got {}", bytes.len());
    }
    let mut iv = [0u8; 16];
    iv[..bytes.len()].copy_from_slice(&bytes);
    Ok(iv)
}

fn run_inspect(units: &Path, scheme: DrmScheme) -> anyhow::Result<()> {
    let ctx = ParseContext {
        scheme,
        constant_iv: None,
    };
    for (index, raw) in read_units(units)?.iter().enumerate() {
        match parse_unit(raw, &ctx) {
            Ok(unit) if !unit.info.is_encrypted() => {
                info!("[{}] clear, {} bytes", index, unit.info.data_length);
            }
            Ok(unit) => {
                let info = unit.info;
                let pattern = info
                    .pattern
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".to_string());
                let runs = info
                    .subsamples
                    .iter()
                    .map(|s| format!("{}+{}", s.clear_bytes, s.encrypted_bytes))
                    .collect::<Vec<_>>()
                    .join(",");
                info!(
                    "[{}] {} kid={} iv={} pattern={} subsamples=[{}] {} bytes",
                    index,
                    info.mode,
                    info.key_id.as_simple(),
                    hex::encode(info.iv),
                    pattern,
                    runs,
                    info.data_length
                );
            }
            Err(e) => warn!("[{}] unparseable: {}", index, e),
        }
    }
    Ok(())
}

fn run_decrypt(
    units: &Path,
    output: &Path,
    key: &str,
    iv: &str,
    mode: CipherMode,
    kid: Option<Uuid>,
    scheme: DrmScheme,
) -> anyhow::Result<()> {
    let key_type = mode
        .key_type()
        .ok_or_else(|| anyhow::anyhow!("Mode {} does not decrypt anything", mode))?;
    let es_type = if mode.is_ctr() { EsType::Ctr } else { EsType::Cbc };
    let key = hex::decode(key).context("Key is not valid hex")?;
    let iv = parse_iv(iv)?;

    let config = DrmConfig {
        scheme,
        ..Default::default()
    };
    let manager = DrmSessionManager::new(Arc::new(ClearKeyEngine::with_key_type(key_type)), config);
    let handle = manager.open()?;
    let mut offline = OfflineDrmInfo::new(key_type, es_type, key, iv);
    if let Some(kid) = kid {
        offline = offline.with_key_id(kid);
    }
    manager.set_offline_drm_info(handle, &offline)?;

    let mut out_file = Vec::new();
    let mut buffer = Vec::new();
    let (mut decrypted, mut skipped) = (0usize, 0usize);
    for (index, raw) in read_units(units)?.iter().enumerate() {
        let unit = match manager.parse(handle, raw) {
            Ok(unit) => unit,
            Err(e) => {
                warn!("[{}] skipped: {}", index, e);
                skipped += 1;
                continue;
            }
        };
        buffer.resize(unit.info.data_length, 0);
        match manager.decrypt(handle, &unit.info, unit.payload, &mut buffer) {
            Ok(written) => {
                out_file.extend_from_slice(&buffer[..written]);
                decrypted += 1;
            }
            Err(e) => {
                warn!("[{}] skipped: {}", index, e);
                skipped += 1;
                if e.is_key_rotation() {
                    // The unit names another key; keep ours for the rest.
                    manager.set_offline_drm_info(handle, &offline)?;
                }
            }
        }
    }
    manager.close(handle);

    std::fs::write(output, &out_file).context("Failed to write output")?;
    info!(
        "[+] Wrote {} units ({} bytes) to {}, skipped {}",
        decrypted,
        out_file.len(),
        output.display(),
        skipped
    );
    Ok(())
}

struct Online {
    manager: Arc<DrmSessionManager>,
    client: LicenseClient,
}

fn connect(config_path: &Path) -> anyhow::Result<Online> {
    let config = DrmConfig::from_path(config_path).context("Failed to load config")?;
    let transport = Arc::new(ReqwestTransport::new(&config.http)?);
    let provisioning_url = config.provisioning_url.clone();
    let manager = Arc::new(DrmSessionManager::new(Arc::new(ClearKeyEngine::new()), config));

    if let Some(url) = provisioning_url {
        let provisioning = ProvisioningClient::new(transport.clone(), url);
        if let Err(e) = manager.start_drm(&provisioning) {
            error!("[-] {}", e.user_message());
            return Err(e).context("Provisioning failed");
        }
        info!("[+] Device provisioned");
    }
    Ok(Online {
        manager,
        client: LicenseClient::new(transport),
    })
}

fn drm_info(config: &DrmConfig, kids: Vec<Uuid>) -> anyhow::Result<DrmInfo> {
    let license = config
        .license
        .as_ref()
        .context("Config has no license section")?;
    let mut info = DrmInfo::new(license.url.clone(), license.request_type).with_key_ids(kids);
    if let Some(ref token) = license.token {
        info = info.with_token(token.clone());
    }
    Ok(info)
}

fn run_license(config_path: &Path, kids: Vec<Uuid>) -> anyhow::Result<()> {
    let Online { manager, client } = connect(config_path)?;
    let handle = manager.open()?;
    info!("[+] Opened DRM Session: {}", handle);

    let request = manager.set_drm_info(handle, drm_info(manager.config(), kids)?)?;
    info!("[+] Created License Request ({} bytes)", request.body.len());

    let result = client.on_license_request(&manager, &request);
    manager.close(handle);
    match result {
        Ok(outcome) => {
            info!("[+] License installed: {:?}", outcome);
            Ok(())
        }
        Err(e) => {
            error!("[-] {} ({})", e.user_message(), e);
            Err(e.into())
        }
    }
}

fn run_play(config_path: &Path, units: &Path, output: &Path) -> anyhow::Result<()> {
    let Online { manager, client } = connect(config_path)?;
    let units = read_units(units)?;
    let retries = manager.config().max_key_rotation_retries;
    let worker = LicenseWorker::spawn(client, manager.clone())?;
    let handle = manager.open()?;

    // The first encrypted unit names the key to license up front.
    let first_kid = units
        .iter()
        .filter_map(|raw| manager.parse(handle, raw).ok())
        .find(|unit| unit.info.is_encrypted())
        .map(|unit| unit.info.key_id);
    if let Some(kid) = first_kid {
        let request = manager.set_drm_info(handle, drm_info(manager.config(), vec![kid])?)?;
        worker.run(request).context("Initial license exchange failed")?;
        info!("[+] License installed for {}", kid.as_simple());
    }

    let mut out_file = Vec::new();
    let mut buffer = Vec::new();
    for (index, raw) in units.iter().enumerate() {
        let unit = match manager.parse(handle, raw) {
            Ok(unit) => unit,
            Err(e) => {
                warn!("[{}] skipped: {}", index, e);
                continue;
            }
        };
        buffer.resize(unit.info.data_length, 0);
        let result = decrypt_with_rotation(
            &manager,
            &worker,
            handle,
            retries,
            &unit.info,
            unit.payload,
            &mut buffer,
        );
        match result {
            Ok(written) => out_file.extend_from_slice(&buffer[..written]),
            Err(e) if e.is_per_sample() => warn!("[{}] skipped: {}", index, e),
            Err(e) => {
                error!("[-] {} ({})", e.user_message(), e);
                manager.close(handle);
                return Err(e.into());
            }
        }
    }
    manager.close(handle);

    std::fs::write(output, &out_file).context("Failed to write output")?;
    info!("[+] Wrote {} bytes to {}", out_file.len(), output.display());
    Ok(())
}

fn decrypt_with_rotation(
    manager: &DrmSessionManager,
    worker: &LicenseWorker,
    handle: SessionHandle,
    retries: u32,
    info: &CryptoInfo,
    input: &[u8],
    output: &mut [u8],
) -> rsdrm::Result<usize> {
    let mut attempt = 0;
    loop {
        match manager.decrypt(handle, info, input, output) {
            Err(Error::NoKeyAvailable(kid)) if attempt < retries => {
                attempt += 1;
                info!("[*] Key rotation to {} (attempt {})", kid.as_simple(), attempt);
                let request = match manager.take_license_request(handle)? {
                    Some(request) => request,
                    None => match manager.update_drm_info(handle)? {
                        Some(request) => request,
                        None => return Err(Error::NoKeyAvailable(kid)),
                    },
                };
                worker.run(request)?;
            }
            result => return result,
        }
    }
}
