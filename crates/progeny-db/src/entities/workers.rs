use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "workers")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub identifier: String,
    pub session_name: String,
    #[sea_orm(unique)]
    pub port: i32,
    #[sea_orm(unique)]
    pub pid: i32,
    pub expiry_timestamp: i64,
    pub created_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl From<Model> for progeny_process::WorkerRecord {
    fn from(m: Model) -> Self {
        Self {
            identifier: m.identifier,
            session_name: m.session_name,
            port: u16::try_from(m.port).unwrap_or_default(),
            pid: u32::try_from(m.pid).unwrap_or_default(),
            expiry_timestamp: m.expiry_timestamp,
            created_at: m.created_at,
        }
    }
}

impl From<&progeny_process::WorkerRecord> for ActiveModel {
    fn from(r: &progeny_process::WorkerRecord) -> Self {
        use sea_orm::Set;
        Self {
            identifier: Set(r.identifier.clone()),
            session_name: Set(r.session_name.clone()),
            port: Set(i32::from(r.port)),
            pid: Set(r.pid as i32),
            expiry_timestamp: Set(r.expiry_timestamp),
            created_at: Set(r.created_at),
        }
    }
}
