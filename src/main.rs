//! gridfs daemon entry point

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use gridfs::config::{Config, MountConfig};
use gridfs::connector::local::{LocalConnector, FILE_SCHEME};
use gridfs::connector::Connector;
use gridfs::dispatch::attr::Owner;
use gridfs::dispatch::Dispatcher;
use gridfs::fuse::DEFAULT_ATTR_TTL;
use gridfs::mount::{MountManager, MountSettings};
use gridfs::path::{MountPoints, PathTranslator};
use gridfs::upload::CatalogUpload;
use gridfs::{GridFsError, Result};

fn print_usage() {
    eprintln!("Usage: gridfs <config.yaml>");
    eprintln!();
    eprintln!("gridfs - mount remote grid storage namespaces as local directories");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  config.yaml    Path to configuration file");
    eprintln!();
    eprintln!("Example:");
    eprintln!("  gridfs /etc/gridfs/config.yaml");
}

/// Backend serving the identifiers of a remote mount point
fn connector_for(remote: &str) -> Result<Arc<dyn Connector>> {
    if remote.starts_with(FILE_SCHEME) {
        return Ok(Arc::new(LocalConnector::new()));
    }
    Err(GridFsError::Config(format!(
        "no backend available for remote {}",
        remote
    )))
}

/// Build the dispatcher for one configured mount
fn build_dispatcher(mount: &MountConfig) -> Result<Dispatcher> {
    let connector = connector_for(&mount.remote)?;

    let mut builder = MountPoints::builder()
        .remote_mount_point(&mount.remote)
        .local_mount_point(&mount.path)
        .guid_mode(mount.guid_mode);
    if let Some(shortcut) = mount.create_attr_shortcut {
        builder = builder.create_attr_shortcut(shortcut);
    }
    let translator = PathTranslator::new(builder.build()?);

    let current = Owner::current();
    let owner = Owner::new(
        mount.uid.unwrap_or(current.uid),
        mount.gid.unwrap_or(current.gid),
    );

    let mut dispatcher = Dispatcher::new(connector.clone(), translator, owner);
    if let Some(upload) = &mount.upload {
        debug!("Mount {:?} creates files through catalog {}", mount.path, upload.lfc_host);
        let workflow = CatalogUpload::for_connector(connector, upload.clone())?;
        dispatcher = dispatcher.with_upload(Arc::new(workflow));
    }
    Ok(dispatcher)
}

fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() != 2 {
        print_usage();
        std::process::exit(1);
    }

    let config_path = PathBuf::from(&args[1]);

    let config = match Config::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("Configuration error: {}", e);
        std::process::exit(1);
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("gridfs starting");
    info!("Loaded configuration from {:?}", config_path);

    let manager = Arc::new(MountManager::new());

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    let m = manager.clone();
    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        r.store(false, Ordering::SeqCst);
        m.unmount_all();
    })?;

    for mount_config in &config.mounts {
        info!("Setting up mount at {:?} for {}", mount_config.path, mount_config.remote);

        let dispatcher = match build_dispatcher(mount_config) {
            Ok(d) => Arc::new(d),
            Err(e) => {
                error!("Failed to set up {:?}: {}", mount_config.path, e);
                continue;
            }
        };

        if !mount_config.path.exists() {
            debug!("Creating mount point directory {:?}", mount_config.path);
            if let Err(e) = std::fs::create_dir_all(&mount_config.path) {
                error!("Failed to create mount point {:?}: {}", mount_config.path, e);
                continue;
            }
        }

        let settings = MountSettings {
            read_only: mount_config.read_only,
            attr_ttl: mount_config.attr_ttl.unwrap_or(DEFAULT_ATTR_TTL),
        };
        if let Err(e) = manager.mount(mount_config.path.clone(), dispatcher, settings) {
            error!("Failed to mount {:?}: {}", mount_config.path, e);
            continue;
        }
    }

    if manager.count() == 0 {
        error!("No filesystems were mounted successfully");
        std::process::exit(1);
    }

    info!("{} filesystem(s) mounted successfully", manager.count());
    info!("Press Ctrl+C to unmount and exit");

    while running.load(Ordering::SeqCst) {
        std::thread::sleep(std::time::Duration::from_secs(1));
    }

    info!("Shutting down");
    manager.unmount_all();
    info!("All filesystems unmounted, exiting");

    Ok(())
}
