//! Wiring of the client: storage, cookie jar, transport, session store,
//! auth gateway and request client, built from a [`Config`].

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::api::{ApiClient, HttpTransport, PersistentCookieJar, Transport};
use crate::auth::{AuthGateway, FileStorage, RecordStorage, SessionState, SessionStore};
use crate::config::Config;
use crate::routing::{Resolution, Router};

pub struct App {
    pub config: Config,
    gateway: AuthGateway,
    api: ApiClient,
    router: Router,
}

impl App {
    /// Open the client against the configured backend and data directory,
    /// restoring any persisted session before returning.
    pub fn open(config: Config) -> Result<Self> {
        let data_dir = config.data_dir()?;
        let storage: Arc<dyn RecordStorage> = Arc::new(FileStorage::new(data_dir));
        let base_url = config.base_url();
        let cookies = Arc::new(PersistentCookieJar::new(Arc::clone(&storage)));
        let transport = HttpTransport::new(&base_url, Arc::clone(&cookies))
            .context("Failed to build HTTP client")?;
        debug!(%base_url, "HTTP transport ready");

        Ok(Self::with_parts(config, Arc::new(transport), storage, Some(cookies)))
    }

    /// Assemble the client from explicit parts.
    pub fn with_parts(
        config: Config,
        transport: Arc<dyn Transport>,
        storage: Arc<dyn RecordStorage>,
        cookies: Option<Arc<PersistentCookieJar>>,
    ) -> Self {
        let store = SessionStore::new(storage);
        store.restore();

        let gateway = match cookies {
            Some(cookies) => AuthGateway::with_cookie_jar(transport, store, cookies),
            None => AuthGateway::new(transport, store),
        };
        let api = ApiClient::new(gateway.clone());

        let state = gateway.store().snapshot();
        info!(authenticated = state.is_authenticated(), "Client ready");

        Self {
            config,
            gateway,
            api,
            router: Router::new(),
        }
    }

    pub fn gateway(&self) -> &AuthGateway {
        &self.gateway
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn store(&self) -> &SessionStore {
        self.gateway.store()
    }

    pub fn state(&self) -> SessionState {
        self.store().snapshot()
    }

    pub fn navigate(&self, path: &str) -> Resolution {
        self.router.resolve(path, &self.state())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemoryStorage;
    use crate::models::Role;
    use crate::routing::Page;
    use crate::test_support::{login_body, token_for, ScriptedTransport};
    use serde_json::json;

    #[tokio::test]
    async fn test_app_restores_and_navigates() {
        let storage: Arc<dyn RecordStorage> = Arc::new(MemoryStorage::new());
        let transport = ScriptedTransport::new();
        let app = App::with_parts(Config::default(), transport.clone(), Arc::clone(&storage), None);

        assert!(!app.state().loading);
        assert_eq!(app.navigate("/teacher-dashboard"), Resolution::Redirect("/login".to_string()));

        let token = token_for("u-1", json!({}));
        transport.respond("/api/auth/login", 200, login_body(&token, "teacher", Some(true)));
        app.gateway().login("ada@example.com", "pw", Role::Teacher).await.unwrap();

        // A second client over the same storage sees the session after restore
        let reopened = App::with_parts(Config::default(), transport, storage, None);
        assert_eq!(
            reopened.navigate("/teacher-dashboard/grades"),
            Resolution::Render(Page::Dashboard {
                role: Role::Teacher,
                section: "grades".to_string()
            })
        );
    }
}
