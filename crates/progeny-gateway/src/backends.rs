use std::{collections::HashMap, sync::Arc};

use progeny_db::entities::workers;
use progeny_process::{Backend, WorkerRecord};
use sea_orm::{ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter};

use crate::config::LookupMode;

/// Session name to backend resolution.
#[derive(Clone)]
pub enum Backends {
    Registry(Arc<DatabaseConnection>),
    Snapshot(Arc<HashMap<String, Backend>>),
}

impl Backends {
    /// Copy every registered worker into memory. Workers started later are
    /// not visible until the gateway restarts.
    pub async fn snapshot(db: &DatabaseConnection) -> Result<Self, DbErr> {
        let rows = workers::Entity::find().all(db).await?;
        let backends = Self::from_records(rows.into_iter().map(WorkerRecord::from));
        if let Self::Snapshot(map) = &backends {
            tracing::info!(count = map.len(), "session snapshot loaded");
        }
        Ok(backends)
    }

    pub fn from_records(records: impl IntoIterator<Item = WorkerRecord>) -> Self {
        Self::Snapshot(Arc::new(
            records
                .into_iter()
                .map(|r| (r.session_name.clone(), r.backend()))
                .collect(),
        ))
    }

    pub fn mode(&self) -> LookupMode {
        match self {
            Self::Registry(_) => LookupMode::Registry,
            Self::Snapshot(_) => LookupMode::Snapshot,
        }
    }

    pub async fn resolve(&self, session_name: &str) -> Result<Option<Backend>, DbErr> {
        match self {
            Self::Registry(db) => Ok(workers::Entity::find()
                .filter(workers::Column::SessionName.eq(session_name))
                .one(&**db)
                .await?
                .map(|m| WorkerRecord::from(m).backend())),
            Self::Snapshot(map) => Ok(map.get(session_name).cloned()),
        }
    }
}
