use std::{path::PathBuf, sync::Arc};

use actix_web::{web::Data, App, HttpServer};
use serde::Deserialize;

mod canonical;
mod error;
mod events;
mod federation;
mod keyring;
mod server_api;
mod sign;
mod state;
mod storage;
mod sync;
mod util;
mod validate;

use error::Error;
use federation::{ingest::Ingester, FederationClient};
use keyring::Keyring;
use state::StateResolver;
use storage::{Storage, StorageManager};
use sync::Notifier;
use util::locks::RoomLocks;

#[derive(Deserialize)]
pub struct Config {
    pub server_name: String,
    #[serde(default = "default_federation_port")]
    pub federation_port: u16,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_federation_port() -> u16 {
    8448
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

pub struct ServerState {
    pub config: Config,
    pub db_manager: Box<dyn StorageManager>,
    pub keyring: Arc<Keyring>,
    pub client: Arc<FederationClient>,
    pub resolver: Arc<StateResolver>,
    pub notifier: Arc<Notifier>,
    pub locks: Arc<RoomLocks>,
    pub ingester: Ingester,
}

impl ServerState {
    pub async fn db(&self) -> Result<Box<dyn Storage>, Error> {
        self.db_manager.get_handle().await
    }
}

#[actix_rt::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("{:?}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    tracing::subscriber::set_global_default(
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .finish(),
    )?;

    let mut config: Config = toml::from_slice(&tokio::fs::read("./config.toml").await?)?;
    if let Ok(name) = std::env::var("HEARTH_SERVER_NAME") {
        config.server_name = name;
    }

    let key = Arc::new(sign::load_or_generate_key(&config.data_dir).await?);
    let keyring = Arc::new(Keyring::new(config.server_name.clone(), Arc::clone(&key)));
    let client = Arc::new(FederationClient::new(config.server_name.clone(), key));

    #[cfg(feature = "storage-sled")]
    let db_manager: Box<dyn StorageManager> =
        Box::new(storage::sled::SledStorageManager::new(config.data_dir.join("db"))?);
    #[cfg(all(feature = "storage-mem", not(feature = "storage-sled")))]
    let db_manager: Box<dyn StorageManager> = Box::new(storage::mem::MemStorageManager::new());

    let resolver = Arc::new(StateResolver::new(db_manager.get_handle().await?));
    let notifier = Arc::new(Notifier::new());
    let locks = Arc::new(RoomLocks::new());
    let ingester = Ingester::new(
        db_manager.get_handle().await?,
        Arc::clone(&resolver),
        Arc::clone(&keyring),
        Some(Arc::clone(&client)),
        Arc::clone(&locks),
        Arc::clone(&notifier),
    );

    let port = config.federation_port;
    let server_state = Arc::new(ServerState {
        config,
        db_manager,
        keyring,
        client,
        resolver,
        notifier,
        locks,
        ingester,
    });

    tracing::info!(
        server_name = %server_state.config.server_name,
        %port,
        "federation listener starting"
    );
    HttpServer::new({
        let server_state = Arc::clone(&server_state);
        move || {
            App::new()
                .app_data(Data::new(Arc::clone(&server_state)))
                // transactions can carry 50 PDUs; the default body cap is too small
                .app_data(actix_web::web::JsonConfig::default().limit(10 * 1024 * 1024))
                .configure(server_api::configure_endpoints)
        }
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await?;

    Ok(())
}
