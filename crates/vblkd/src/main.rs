//! vblkd — userspace NBD block device daemon.
//!
//! Startup: parse flags, build the configured backing device, bind it to an
//! NBD device node, then run the request engine until the kernel
//! disconnects or a signal arrives.

#[cfg(not(target_os = "linux"))]
compile_error!("vblkd requires the Linux NBD driver");

mod config;

use std::path::Path;
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use vblk_core::{engine, nbdkern, Device};
use vblk_proto::{VbdError, VbdResult};
use vblk_store::dedup::DedupDevice;
use vblk_store::file::FileDevice;
use vblk_store::mem::MemDevice;
use vblk_store::object::dir::DirContainer;
use vblk_store::object::{Container, ObjStoreDevice, Options};

use config::{Config, DevType};

fn main() {
    let cfg = match Config::from_args() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("vblkd: {err}");
            std::process::exit(2);
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("vblkd v{}: {}", env!("CARGO_PKG_VERSION"), cfg.describe());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("tokio runtime");
    if let Err(err) = runtime.block_on(run(cfg)) {
        error!("fatal: {err}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> VbdResult<()> {
    let device = build_device(&cfg).await?;

    let (handle, stream) =
        nbdkern::attach(device.as_ref(), cfg.nbd_dev.as_deref(), cfg.nbd_max_devs).await?;
    info!("block device ready at {}", handle.dev_path().display());

    let mut serving = tokio::spawn(engine::serve(stream, Arc::clone(&device), 0));

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => info!("interrupted, shutting down"),
        _ = sigterm.recv() => info!("terminated, shutting down"),
        result = &mut serving => {
            // The kernel disconnected on its own; detach and report.
            let served = result.map_err(|e| VbdError::Protocol(format!("engine task died: {e}")))?;
            handle.detach().await?;
            return served;
        }
    }

    // Detaching tears down the kernel socket, which unwinds the engine and
    // closes the device.
    handle.detach().await?;
    serving
        .await
        .map_err(|e| VbdError::Protocol(format!("engine task died: {e}")))??;
    Ok(())
}

async fn build_device(cfg: &Config) -> VbdResult<Arc<dyn Device>> {
    Ok(match cfg.dev_type {
        DevType::Mem => Arc::new(MemDevice::new(cfg.store_bytes)),

        DevType::File => Arc::new(FileDevice::open(
            &cfg.store_dir.join(&cfg.store_name),
            cfg.store_bytes,
        )?),

        DevType::Dedup => Arc::new(DedupDevice::open(
            &cfg.store_dir,
            &cfg.store_name,
            cfg.store_bytes,
            cfg.dedup_cache_bytes,
        )?),

        DevType::ObjStore => {
            let objstore = cfg.objstore.as_ref().expect("objstore config is present");

            let container: Arc<dyn Container> = match objstore.kind.as_str() {
                "local" => {
                    let path = objstore.cfg.get("path").ok_or_else(|| {
                        VbdError::Config("local objectstore requires a \"path\" setting".into())
                    })?;
                    Arc::new(DirContainer::open(Path::new(path))?)
                }
                other => {
                    return Err(VbdError::Config(format!(
                        "objectstore kind {other:?} is not built into this binary; \
                         bundled kinds: local"
                    )))
                }
            };

            let cache_dir = cfg.store_dir.join(format!("{}-cache", cfg.store_name));
            std::fs::create_dir_all(&cache_dir)?;

            let mut opts = Options::default()
                .compress(objstore.compress)
                .concur_flush_count(objstore.concur_flush)
                .quota_bytes(objstore.disk_cache_bytes)
                .autoflush_interval(objstore.flush_every);
            if !objstore.aes_key.is_empty() {
                opts = opts.encrypt(objstore.aes_mode, objstore.aes_key.clone());
            }

            ObjStoreDevice::new(
                container,
                &cache_dir,
                cfg.store_bytes,
                objstore.object_bytes,
                opts,
            )
            .await?
        }
    })
}
