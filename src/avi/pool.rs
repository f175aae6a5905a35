use std::{collections::HashMap, sync::Arc};

use tokio::sync::Mutex;
use tracing::*;

use super::client::{AviClient, AviClientConfig, RestAviClient};
use super::error::AviResult;

type Factory = dyn Fn(AviClientConfig) -> AviResult<Arc<dyn AviClient>> + Send + Sync;

/// Process-wide cache of authenticated AVI sessions.
///
/// ADCs pointing at the same controller with the same credentials share one
/// client; a credential or CA rotation yields a new key and a fresh session.
pub struct AviClientPool {
    clients: Mutex<HashMap<AviClientConfig, Arc<dyn AviClient>>>,
    factory: Box<Factory>,
}

impl Default for AviClientPool {
    fn default() -> Self {
        Self::with_factory(|config| Ok(Arc::new(RestAviClient::new(config)?) as Arc<dyn AviClient>))
    }
}

impl AviClientPool {
    pub fn with_factory(
        factory: impl Fn(AviClientConfig) -> AviResult<Arc<dyn AviClient>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            factory: Box::new(factory),
        }
    }

    pub async fn get_or_create(&self, config: AviClientConfig) -> AviResult<Arc<dyn AviClient>> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&config) {
            return Ok(client.clone());
        }
        // drop stale sessions for the same controller and user
        clients.retain(|k, _| {
            !(k.controller == config.controller
                && k.username == config.username
                && k.tenant == config.tenant)
        });
        debug!(controller = %config.controller, tenant = %config.tenant, "creating AVI client");
        let client = (self.factory)(config.clone())?;
        clients.insert(config, client.clone());
        Ok(client)
    }

    pub async fn len(&self) -> usize {
        self.clients.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
