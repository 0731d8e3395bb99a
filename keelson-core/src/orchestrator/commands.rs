//! In-container command lines for PostgreSQL management.
//!
//! Builders are pure so the exact argv can be asserted in tests. SQL runs
//! through `psql` over the local socket, where the stock image trusts the
//! admin role.

use keelson_model::POSTGRES_PORT;

/// Data directory inside every node. Kept one level below the volume mount so
/// an empty volume can receive a base backup.
pub const PGDATA: &str = "/var/lib/postgresql/data/pgdata";
pub const DATA_MOUNT: &str = "/var/lib/postgresql/data";
/// Present once a replica's data directory holds a complete base backup.
pub const BOOTSTRAP_MARKER: &str = "/var/lib/postgresql/data/.keelson-bootstrapped";

const HBA_TAG: &str = "# keelson replication";

fn strings<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

/// `psql` invocation with unaligned, tuples-only output and one `-c` per
/// statement (each runs in its own implicit transaction, which `ALTER SYSTEM`
/// requires).
pub fn psql(user: &str, statements: &[&str]) -> Vec<String> {
    let mut argv = strings([
        "psql",
        "-U",
        user,
        "-d",
        "postgres",
        "-v",
        "ON_ERROR_STOP=1",
        "-At",
        "-F",
        "|",
    ]);
    for statement in statements {
        argv.push("-c".to_string());
        argv.push(statement.to_string());
    }
    argv
}

/// Runs a shell snippet as the `postgres` OS user.
pub fn as_postgres_shell(script: &str) -> Vec<String> {
    strings(["gosu", "postgres", "sh", "-c", script])
}

pub fn pg_isready(user: &str) -> Vec<String> {
    let port = POSTGRES_PORT.to_string();
    strings(["pg_isready", "-U", user, "-h", "localhost", "-p", port.as_str()])
}

/// Container command for replicas: idle until the bootstrap marker exists,
/// then the stock entrypoint.
pub fn replica_container_command() -> Vec<String> {
    vec![
        "bash".to_string(),
        "-c".to_string(),
        format!(
            "if [ -f {BOOTSTRAP_MARKER} ]; then exec docker-entrypoint.sh postgres; fi; \
             trap 'exit 0' TERM; sleep infinity & wait"
        ),
    ]
}

fn quote_literal(value: &str) -> String {
    value.replace('\'', "''")
}

/// Creates or refreshes the replication role.
pub fn create_replication_role(user: &str, password: &str) -> String {
    let user = quote_literal(user);
    let password = quote_literal(password);
    format!(
        "DO $$ BEGIN \
         IF EXISTS (SELECT FROM pg_roles WHERE rolname = '{user}') THEN \
         ALTER ROLE \"{user}\" WITH REPLICATION LOGIN PASSWORD '{password}'; \
         ELSE \
         CREATE ROLE \"{user}\" WITH REPLICATION LOGIN PASSWORD '{password}'; \
         END IF; END $$;"
    )
}

/// Appends a `pg_hba.conf` rule admitting replication connections from the
/// cluster network, once.
pub fn allow_replication_hba(user: &str) -> Vec<String> {
    as_postgres_shell(&format!(
        "grep -q '{HBA_TAG}' \"$PGDATA/pg_hba.conf\" || \
         echo 'host replication {user} all scram-sha-256 {HBA_TAG}' >> \"$PGDATA/pg_hba.conf\""
    ))
}

pub const RELOAD_CONF: &str = "SELECT pg_reload_conf()";

pub fn conninfo(
    primary_host: &str,
    user: &str,
    password: &str,
    application_name: &str,
) -> String {
    format!(
        "host={primary_host} port={POSTGRES_PORT} user={user} password={password} application_name={application_name}"
    )
}

/// Streams a base backup from the primary into the empty data directory,
/// writing standby configuration (`-R`).
pub fn base_backup(primary_host: &str, user: &str, password: &str) -> Vec<String> {
    let port = POSTGRES_PORT.to_string();
    let pgpassword = format!("PGPASSWORD={password}");
    strings([
        "gosu",
        "postgres",
        "env",
        pgpassword.as_str(),
        "pg_basebackup",
        "-h",
        primary_host,
        "-p",
        port.as_str(),
        "-U",
        user,
        "-D",
        PGDATA,
        "-Fp",
        "-Xs",
        "-P",
        "-R",
    ])
}

/// Pins `primary_conninfo` (with the node's `application_name`) in
/// `postgresql.auto.conf`, ensures `standby.signal`, and sets the bootstrap
/// marker.
pub fn finish_replica_bootstrap(conninfo: &str) -> Vec<String> {
    let conninfo = conninfo.replace('\'', "''");
    as_postgres_shell(&format!(
        "echo \"primary_conninfo = '{conninfo}'\" >> {PGDATA}/postgresql.auto.conf && \
         touch {PGDATA}/standby.signal && \
         touch {BOOTSTRAP_MARKER}"
    ))
}

pub const PROMOTE: &str = "SELECT pg_promote()";
pub const IS_IN_RECOVERY: &str = "SELECT pg_is_in_recovery()";
pub const ACTIVE_CONNECTIONS: &str =
    "SELECT count(*) FROM pg_stat_activity WHERE backend_type = 'client backend'";

pub const REPLICATION_VIEW: &str = "SELECT application_name, \
     COALESCE(state, ''), \
     COALESCE(sync_state, ''), \
     COALESCE(pg_wal_lsn_diff(pg_current_wal_lsn(), replay_lsn), 0)::bigint, \
     COALESCE(EXTRACT(EPOCH FROM replay_lag), 0)::float8 \
     FROM pg_stat_replication";

/// Points a standby (or a demoted primary) at the current primary.
pub fn primary_conninfo_statement(conninfo: &str) -> String {
    format!(
        "ALTER SYSTEM SET primary_conninfo = '{}'",
        quote_literal(conninfo)
    )
}

pub fn touch_standby_signal() -> Vec<String> {
    as_postgres_shell(&format!("touch {PGDATA}/standby.signal"))
}

/// `synchronous_standby_names` for the given standbys; empty disables
/// synchronous commit waits.
pub fn sync_standby_statement(standbys: &[String]) -> String {
    let value = if standbys.is_empty() {
        String::new()
    } else {
        let names: Vec<String> =
            standbys.iter().map(|n| format!("\"{n}\"")).collect();
        format!("ANY 1 ({})", names.join(", "))
    };
    format!(
        "ALTER SYSTEM SET synchronous_standby_names = '{}'",
        quote_literal(&value)
    )
}

/// One row of `pg_stat_replication` as rendered by [`REPLICATION_VIEW`].
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationRow {
    pub application_name: String,
    pub state: String,
    pub sync_state: String,
    pub lag_bytes: i64,
    pub lag_seconds: f64,
}

/// Parses `psql -At -F '|'` output of [`REPLICATION_VIEW`]. Malformed lines
/// are skipped.
pub fn parse_replication_rows(output: &str) -> Vec<ReplicationRow> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.trim().split('|').collect();
            if fields.len() != 5 || fields[0].is_empty() {
                return None;
            }
            Some(ReplicationRow {
                application_name: fields[0].to_string(),
                state: fields[1].to_string(),
                sync_state: fields[2].to_string(),
                lag_bytes: fields[3].parse().ok()?,
                lag_seconds: fields[4].parse().ok()?,
            })
        })
        .collect()
}

/// `psql -At` renders booleans as `t`/`f`.
pub fn parse_bool(output: &str) -> Option<bool> {
    match output.trim() {
        "t" => Some(true),
        "f" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn psql_sends_each_statement_separately() {
        let argv = psql("postgres", &["ALTER SYSTEM SET x = 1", RELOAD_CONF]);
        let flags: Vec<&String> =
            argv.iter().filter(|a| a.as_str() == "-c").collect();
        assert_eq!(flags.len(), 2);
        assert_eq!(argv.last().map(String::as_str), Some(RELOAD_CONF));
        assert!(argv.contains(&"-At".to_string()));
    }

    #[test]
    fn base_backup_targets_primary_alias() {
        let argv = base_backup("keelson-pg-abc-0", "replicator", "pw");
        assert!(argv.windows(2).any(|w| w == ["-h", "keelson-pg-abc-0"]));
        assert!(argv.windows(2).any(|w| w == ["-D", PGDATA]));
        assert!(argv.contains(&"-R".to_string()));
        assert!(argv.contains(&"-Xs".to_string()));
    }

    #[test]
    fn sync_statement_lists_standbys_or_clears() {
        let set = sync_standby_statement(&["pg-1".into(), "pg-2".into()]);
        assert_eq!(
            set,
            "ALTER SYSTEM SET synchronous_standby_names = 'ANY 1 (\"pg-1\", \"pg-2\")'"
        );
        let cleared = sync_standby_statement(&[]);
        assert_eq!(cleared, "ALTER SYSTEM SET synchronous_standby_names = ''");
    }

    #[test]
    fn replication_role_escapes_quotes() {
        let sql = create_replication_role("replicator", "it's");
        assert!(sql.contains("PASSWORD 'it''s'"));
    }

    #[test]
    fn parses_replication_rows_and_skips_garbage() {
        let output = "pg-1|streaming|async|0|0\n\
                      pg-2|catchup|sync|16384|1.5\n\
                      garbage\n";
        let rows = parse_replication_rows(output);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].application_name, "pg-2");
        assert_eq!(rows[1].lag_bytes, 16384);
        assert_eq!(rows[1].lag_seconds, 1.5);
        assert_eq!(rows[1].sync_state, "sync");
    }

    #[test]
    fn parse_bool_reads_psql_output() {
        assert_eq!(parse_bool("f\n"), Some(false));
        assert_eq!(parse_bool("t"), Some(true));
        assert_eq!(parse_bool(""), None);
    }

    #[test]
    fn replica_command_waits_for_marker() {
        let command = replica_container_command();
        assert_eq!(command[0], "bash");
        assert!(command[2].contains(BOOTSTRAP_MARKER));
        assert!(command[2].contains("sleep infinity"));
    }
}
