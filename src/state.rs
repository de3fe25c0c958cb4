//! Shared application state injected into every handler and background task.

use axum::extract::FromRef;
use std::sync::Arc;

use crate::config::Config;
use crate::db::DbPool;
use crate::services::channel_access::ChannelAccess;
use crate::services::nowpayments::NowPaymentsClient;
use crate::services::ton_explorer::ChainExplorer;

#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub config: Arc<Config>,
    /// Telegram side effects; also exposes the raw Bot API client.
    pub access: ChannelAccess,
    pub nowpayments: NowPaymentsClient,
    pub explorer: Arc<dyn ChainExplorer>,
}

/// Lets handlers that only touch the database take `State<DbPool>`.
impl FromRef<AppState> for DbPool {
    fn from_ref(state: &AppState) -> Self {
        state.pool.clone()
    }
}

impl FromRef<AppState> for Arc<Config> {
    fn from_ref(state: &AppState) -> Self {
        state.config.clone()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use crate::services::telegram::TelegramApi;

    /// State over a lazy pool that never connects unless a query runs.
    pub(crate) fn test_state(
        config: Config,
        explorer: Arc<dyn ChainExplorer>,
        telegram: Arc<dyn TelegramApi>,
    ) -> AppState {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy(&config.database_url)
            .unwrap();
        let nowpayments = NowPaymentsClient::new(&config.nowpayments_api_url, None).unwrap();
        AppState {
            pool,
            access: ChannelAccess::new(telegram, config.invite_link_ttl_hours),
            config: Arc::new(config),
            nowpayments,
            explorer,
        }
    }

    #[tokio::test]
    async fn pool_and_config_are_shared_by_reference() {
        let state = test_state(
            test_config(),
            Arc::new(crate::services::ton_explorer::tests::FakeExplorer::default()),
            Arc::new(crate::services::telegram::tests::FakeTelegram::default()),
        );
        let config = Arc::<Config>::from_ref(&state);
        assert!(Arc::ptr_eq(&config, &state.config));
    }
}
