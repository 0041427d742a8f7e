//! Command-line configuration.
//!
//! Argument names group by the backing driver they apply to: `-store-*`
//! options are universal, `--dedup-*` and `--objstore-*` only matter for
//! their device type. Sizes accept IEC and SI suffixes ("512 MiB", "20GB"),
//! durations accept `ms`/`s`/`m`/`h` suffixes.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use vblk_proto::{VbdError, VbdResult};
use vblk_store::object::{encrypt, CompressMode, EncryptMode};

const DEFAULT_KEY_FILE: &str = "key.aes";
const OBJSTORE_KINDS: &[&str] = &[
    "s3", "b2", "local", "azure", "swift", "google", "oracle", "sftp",
];

/// Userspace NBD block device daemon.
///
/// Exports a virtual block device on /dev/nbdN backed by memory, a flat
/// file, a deduplicating store, or a remote object store with a local cache.
#[derive(Debug, Parser)]
#[command(name = "vblkd", version)]
pub struct Args {
    /// Backing device type: mem, file, dedup, objstore
    #[arg(long = "dev-type", default_value = "mem")]
    dev_type: String,

    /// NBD devices to provision if this daemon loads the kernel module
    #[arg(long = "nbd-max-devs", default_value_t = 32)]
    nbd_max_devs: u32,

    /// Directory for backing disk files (must exist for non-mem devices)
    #[arg(long = "store-dir", default_value = "./")]
    store_dir: PathBuf,

    /// Base name for backing disk files
    #[arg(long = "store-name", default_value = "test-lun")]
    store_name: String,

    /// Device capacity (e.g. "100 MiB", "20 GiB")
    #[arg(long = "store-size", default_value = "1 GiB")]
    store_size: String,

    /// Memory for the dedup ID store cache (e.g. "512 MiB")
    #[arg(long = "dedup-memcache", default_value = "512 MiB")]
    dedup_memcache: String,

    /// Remote objectstore kind: s3, b2, local, azure, swift, google,
    /// oracle, sftp (only "local" is bundled)
    #[arg(long = "objstore-kind", default_value = "local")]
    objstore_kind: String,

    /// Objectstore driver configuration as JSON (for "local": {"path": DIR},
    /// defaulting to <store-dir>/<store-name>-objstore)
    #[arg(long = "objstore-cfg", default_value = "{}")]
    objstore_cfg: String,

    /// Size of remote objects (e.g. "32 MiB")
    #[arg(long = "objstore-objsize", default_value = "64 MiB")]
    objstore_objsize: String,

    /// Disk for caching remote objects; 0 means full local backing
    #[arg(long = "objstore-diskcache", default_value = "0")]
    objstore_diskcache: String,

    /// AES mode for remote objects: aes-ctr, aes-cfb, aes-ofb, identity;
    /// "aes-rec" selects the recommended mode (aes-ctr)
    #[arg(long = "objstore-aesmode", default_value = "aes-rec")]
    objstore_aesmode: String,

    /// AES key source: key:<literal>, file:<path>, env:<var>; if absent a
    /// key is generated and saved to <store-dir>/key.aes
    #[arg(long = "objstore-aeskey", default_value = "")]
    objstore_aeskey: String,

    /// Compression for remote objects: s2, gzip, identity
    #[arg(long = "objstore-compress", default_value = "s2")]
    objstore_compress: String,

    /// Max concurrent uploads of dirty objects; 0 selects a heuristic
    #[arg(long = "objstore-concurflush", default_value_t = 0)]
    objstore_concurflush: usize,

    /// How often dirty objects are uploaded ("10s", "1m"); 0s disables
    #[arg(long = "objstore-flushevery", default_value = "10s")]
    objstore_flushevery: String,

    /// Log filter (trace, debug, info, warn, error)
    #[arg(long = "log-level", default_value = "info")]
    pub log_level: String,

    /// NBD device node to use (e.g. /dev/nbd0); the first free one when
    /// absent
    nbd_dev: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevType {
    Mem,
    File,
    Dedup,
    ObjStore,
}

#[derive(Debug)]
pub struct ObjStoreConfig {
    pub kind: String,
    pub cfg: HashMap<String, String>,
    pub object_bytes: u64,
    pub disk_cache_bytes: u64,
    pub aes_mode: EncryptMode,
    pub aes_key: Vec<u8>,
    pub compress: CompressMode,
    pub concur_flush: usize,
    pub flush_every: Duration,
}

#[derive(Debug)]
pub struct Config {
    pub dev_type: DevType,
    pub nbd_dev: Option<String>,
    pub nbd_max_devs: u32,
    pub store_dir: PathBuf,
    pub store_name: String,
    pub store_bytes: u64,
    pub dedup_cache_bytes: u64,
    pub objstore: Option<ObjStoreConfig>,
    pub log_level: String,
}

impl Config {
    pub fn from_args() -> VbdResult<Self> {
        Self::from_parsed(Args::parse())
    }

    fn from_parsed(args: Args) -> VbdResult<Self> {
        let dev_type = match args.dev_type.as_str() {
            "mem" => DevType::Mem,
            "file" => DevType::File,
            "dedup" => DevType::Dedup,
            "objstore" => DevType::ObjStore,
            other => {
                return Err(VbdError::Config(format!(
                    "unknown backing device type {other:?}"
                )))
            }
        };

        if args.store_name.is_empty() {
            return Err(VbdError::Config(
                "no volume name was provided (use --store-name)".into(),
            ));
        }

        let store_dir = if dev_type == DevType::Mem {
            args.store_dir.clone()
        } else {
            let dir = args
                .store_dir
                .canonicalize()
                .map_err(|e| {
                    VbdError::Config(format!(
                        "storage directory {} is not usable: {e}",
                        args.store_dir.display()
                    ))
                })?;
            if !dir.is_dir() {
                return Err(VbdError::Config(format!(
                    "storage path {} is not a directory",
                    dir.display()
                )));
            }
            dir
        };

        let store_bytes = parse_capacity(&args.store_size)?;
        let dedup_cache_bytes = parse_capacity(&args.dedup_memcache)?;

        let objstore = if dev_type == DevType::ObjStore {
            Some(parse_objstore(&args, &store_dir)?)
        } else {
            None
        };

        Ok(Config {
            dev_type,
            nbd_dev: args.nbd_dev,
            nbd_max_devs: args.nbd_max_devs,
            store_dir,
            store_name: args.store_name,
            store_bytes,
            dedup_cache_bytes,
            objstore,
            log_level: args.log_level,
        })
    }

    /// One-line description of what this daemon will export.
    pub fn describe(&self) -> String {
        let dev = self
            .nbd_dev
            .as_deref()
            .unwrap_or("the next available NBD device");
        let kind = match self.dev_type {
            DevType::Mem => "memory",
            DevType::File => "a flat file",
            DevType::Dedup => "a deduplicating store",
            DevType::ObjStore => "an object store",
        };
        format!(
            "exporting {} byte volume {:?} as {dev}, backed by {kind} under {}",
            self.store_bytes,
            self.store_name,
            self.store_dir.display()
        )
    }
}

fn parse_objstore(args: &Args, store_dir: &std::path::Path) -> VbdResult<ObjStoreConfig> {
    let kind = args.objstore_kind.to_lowercase();
    if kind.is_empty() {
        return Err(VbdError::Config(
            "an objectstore kind must be provided (--objstore-kind)".into(),
        ));
    }
    if !OBJSTORE_KINDS.contains(&kind.as_str()) {
        return Err(VbdError::Config(format!(
            "unknown objectstore kind {kind:?}"
        )));
    }

    let mut cfg: HashMap<String, String> = serde_json::from_str(&args.objstore_cfg)
        .map_err(|e| VbdError::Config(format!("objectstore JSON configuration: {e}")))?;
    if kind == "local" && !cfg.contains_key("path") {
        let default = store_dir.join(format!("{}-objstore", args.store_name));
        cfg.insert("path".into(), default.to_string_lossy().into_owned());
    }

    let object_bytes = parse_capacity(&args.objstore_objsize)?;
    let disk_cache_bytes = parse_capacity(&args.objstore_diskcache)?;

    let aes_mode = EncryptMode::from_name(&args.objstore_aesmode).ok_or_else(|| {
        VbdError::Config(format!("unknown AES mode {:?}", args.objstore_aesmode))
    })?;
    let aes_key = if aes_mode == EncryptMode::Identity {
        Vec::new()
    } else {
        resolve_aes_key(&args.objstore_aeskey, store_dir)?
    };

    let compress = CompressMode::from_name(&args.objstore_compress).ok_or_else(|| {
        VbdError::Config(format!(
            "unknown compression mode {:?}",
            args.objstore_compress
        ))
    })?;

    let concur_flush = if args.objstore_concurflush == 0 {
        recommended_concur_flush(object_bytes)
    } else {
        args.objstore_concurflush
    };

    Ok(ObjStoreConfig {
        kind,
        cfg,
        object_bytes,
        disk_cache_bytes,
        aes_mode,
        aes_key,
        compress,
        concur_flush,
        flush_every: parse_duration(&args.objstore_flushevery)?,
    })
}

/// Resolve the AES key from its source spec, or generate-and-persist one
/// under the storage directory when no source is given.
fn resolve_aes_key(spec: &str, store_dir: &std::path::Path) -> VbdResult<Vec<u8>> {
    let key = if spec.is_empty() {
        let key_file = store_dir.join(DEFAULT_KEY_FILE);
        match fs::read(&key_file) {
            Ok(key) => key,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let key = encrypt::random_key();
                fs::write(&key_file, &key).map_err(|e| {
                    VbdError::Config(format!(
                        "could not save generated AES key to {}: {e}",
                        key_file.display()
                    ))
                })?;
                tracing::info!(
                    "generated an AES-256 key and stored it in {}",
                    key_file.display()
                );
                key
            }
            Err(err) => {
                return Err(VbdError::Config(format!(
                    "could not read AES key file {}: {e}",
                    key_file.display(),
                    e = err
                )))
            }
        }
    } else if let Some(path) = spec.strip_prefix("file:") {
        fs::read(path)
            .map_err(|e| VbdError::Config(format!("could not read AES key file {path:?}: {e}")))?
    } else if let Some(literal) = spec.strip_prefix("key:") {
        literal.as_bytes().to_vec()
    } else if let Some(var) = spec.strip_prefix("env:") {
        std::env::var(var)
            .map_err(|_| {
                VbdError::Config(format!("AES key environment variable {var:?} is not set"))
            })?
            .into_bytes()
    } else {
        return Err(VbdError::Config(format!(
            "AES key source {spec:?} is not valid (use key:, file:, or env:)"
        )));
    };

    encrypt::validate_key(&key)?;
    Ok(key)
}

/// Upload concurrency heuristic: one worker per CPU, capped so that
/// `workers * object size` stays within a 1 GiB buffer budget.
fn recommended_concur_flush(object_bytes: u64) -> usize {
    const BUDGET: u64 = 1024 * 1024 * 1024;
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1) as u64;
    cpus.min(BUDGET / object_bytes.max(1)).max(1) as usize
}

/// Parse a human byte size: plain bytes, SI (KB/MB/GB/TB), or IEC
/// (KiB/MiB/GiB/TiB), case-insensitive, optional whitespace.
pub fn parse_capacity(input: &str) -> VbdResult<u64> {
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    if number.is_empty() {
        return Err(VbdError::Config(format!("unparsable size {input:?}")));
    }
    let value: f64 = number
        .parse()
        .map_err(|e| VbdError::Config(format!("unparsable size {input:?}: {e}")))?;

    let multiplier: u64 = match unit.trim().to_lowercase().as_str() {
        "" | "b" => 1,
        "kb" => 1000,
        "mb" => 1000 * 1000,
        "gb" => 1000 * 1000 * 1000,
        "tb" => 1000 * 1000 * 1000 * 1000,
        "k" | "kib" => 1 << 10,
        "m" | "mib" => 1 << 20,
        "g" | "gib" => 1 << 30,
        "t" | "tib" => 1 << 40,
        other => {
            return Err(VbdError::Config(format!(
                "unknown size unit {other:?} in {input:?}"
            )))
        }
    };
    Ok((value * multiplier as f64) as u64)
}

/// Parse a duration with an `ms`, `s`, `m`, or `h` suffix; bare numbers are
/// seconds.
pub fn parse_duration(input: &str) -> VbdResult<Duration> {
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    if number.is_empty() {
        return Err(VbdError::Config(format!("unparsable duration {input:?}")));
    }
    let value: f64 = number
        .parse()
        .map_err(|e| VbdError::Config(format!("unparsable duration {input:?}: {e}")))?;

    let duration = match unit.trim() {
        "ms" => Duration::from_secs_f64(value / 1000.0),
        "" | "s" => Duration::from_secs_f64(value),
        "m" => Duration::from_secs_f64(value * 60.0),
        "h" => Duration::from_secs_f64(value * 3600.0),
        other => {
            return Err(VbdError::Config(format!(
                "unknown duration unit {other:?} in {input:?}"
            )))
        }
    };
    Ok(duration)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacities_parse_in_both_systems() {
        assert_eq!(parse_capacity("4096").unwrap(), 4096);
        assert_eq!(parse_capacity("4 KiB").unwrap(), 4096);
        assert_eq!(parse_capacity("20 GiB").unwrap(), 20 << 30);
        assert_eq!(parse_capacity("20GiB").unwrap(), 20 << 30);
        assert_eq!(parse_capacity("1 kb").unwrap(), 1000);
        assert_eq!(parse_capacity("1.5 MiB").unwrap(), 3 << 19);
        assert_eq!(parse_capacity("0").unwrap(), 0);
    }

    #[test]
    fn bad_capacities_are_rejected() {
        assert!(parse_capacity("").is_err());
        assert!(parse_capacity("GiB").is_err());
        assert!(parse_capacity("12 parsecs").is_err());
    }

    #[test]
    fn durations_parse() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("0s").unwrap(), Duration::ZERO);
        assert!(parse_duration("ten minutes").is_err());
    }

    #[test]
    fn key_sources_resolve() {
        let tmp = tempfile::tempdir().unwrap();

        // Literal.
        let key = resolve_aes_key("key:0123456789abcdef", tmp.path()).unwrap();
        assert_eq!(key.len(), 16);

        // File.
        let key_path = tmp.path().join("k");
        fs::write(&key_path, [7u8; 32]).unwrap();
        let spec = format!("file:{}", key_path.display());
        assert_eq!(resolve_aes_key(&spec, tmp.path()).unwrap(), vec![7u8; 32]);

        // Environment.
        std::env::set_var("VBLKD_TEST_AES_KEY", "0123456789abcdef01234567");
        let key = resolve_aes_key("env:VBLKD_TEST_AES_KEY", tmp.path()).unwrap();
        assert_eq!(key.len(), 24);

        // Unknown scheme.
        assert!(resolve_aes_key("vault:secret", tmp.path()).is_err());
    }

    #[test]
    fn absent_key_spec_generates_and_persists() {
        let tmp = tempfile::tempdir().unwrap();
        let first = resolve_aes_key("", tmp.path()).unwrap();
        assert_eq!(first.len(), 32);
        assert!(tmp.path().join(DEFAULT_KEY_FILE).exists());

        // A second resolution reuses the stored key.
        let second = resolve_aes_key("", tmp.path()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn bad_keys_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(resolve_aes_key("key:short", tmp.path()).is_err());
        assert!(resolve_aes_key(&format!("key:{}", "\0".repeat(32)), tmp.path()).is_err());
    }

    #[test]
    fn concur_flush_heuristic_respects_the_buffer_budget() {
        // Huge objects collapse to a single worker.
        assert_eq!(recommended_concur_flush(2 << 30), 1);
        // Small objects are capped by the CPU count.
        let cpus = std::thread::available_parallelism().unwrap().get();
        assert_eq!(recommended_concur_flush(1 << 20), cpus.min(1024));
    }
}
