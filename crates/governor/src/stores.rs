use std::sync::Arc;

use runwarden_db::repositories::{
    CredentialRepository, PolicyRepository, RequestLogRepository, RunRepository,
    SpendRepository, SqlCredentialRepository, SqlPolicyRepository, SqlRequestLogRepository,
    SqlRunRepository, SqlSpendRepository, SqlTeamRepository, TeamRepository,
};
use runwarden_db::DbPool;

/// Repository handles shared by every governance component.
#[derive(Clone)]
pub struct Stores {
    pub teams: Arc<dyn TeamRepository>,
    pub credentials: Arc<dyn CredentialRepository>,
    pub policies: Arc<dyn PolicyRepository>,
    pub runs: Arc<dyn RunRepository>,
    pub spend: Arc<dyn SpendRepository>,
    pub request_logs: Arc<dyn RequestLogRepository>,
}

impl Stores {
    pub fn sqlite(pool: DbPool) -> Self {
        Self {
            teams: Arc::new(SqlTeamRepository::new(pool.clone())),
            credentials: Arc::new(SqlCredentialRepository::new(pool.clone())),
            policies: Arc::new(SqlPolicyRepository::new(pool.clone())),
            runs: Arc::new(SqlRunRepository::new(pool.clone())),
            spend: Arc::new(SqlSpendRepository::new(pool.clone())),
            request_logs: Arc::new(SqlRequestLogRepository::new(pool)),
        }
    }
}
