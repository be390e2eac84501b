// Embedded SQL migrations, applied in order by `Database::run_migrations`

pub const CHANGE_REQUESTS_SCHEMA: &str = include_str!("../../migrations/001_change_requests.sql");
pub const ENVIRONMENT_POLICIES_SCHEMA: &str =
    include_str!("../../migrations/002_environment_policies.sql");
pub const ENTITY_LOCKS_SCHEMA: &str = include_str!("../../migrations/003_entity_locks.sql");

pub const MIGRATIONS: &[(&str, &str)] = &[
    ("001_change_requests", CHANGE_REQUESTS_SCHEMA),
    ("002_environment_policies", ENVIRONMENT_POLICIES_SCHEMA),
    ("003_entity_locks", ENTITY_LOCKS_SCHEMA),
];
