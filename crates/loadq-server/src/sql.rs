//! Load statement text.
//!
//! Every load stages its files into a temp table, removes the rows it is about
//! to replace, inserts the newest row per merge key, and drops the staging
//! table. Both builders are pure.

use crate::tracker::PayloadRef;

/// How rows already in the target table are reconciled with staged rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupMode {
    /// Keep whichever side has the newer merge timestamp.
    MergeDuplicatePks,
    /// Only replace rows whose key and timestamp both match.
    ExactMatch,
}

impl DedupMode {
    pub fn from_flag(merge_duplicate_pks: bool) -> Self {
        if merge_duplicate_pks {
            DedupMode::MergeDuplicatePks
        } else {
            DedupMode::ExactMatch
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadStatementParams<'a> {
    pub table: &'a str,
    pub staging_table: &'a str,
    pub merge_pk: &'a str,
    pub merge_timestamp: &'a str,
    pub manifests: &'a [PayloadRef],
    pub role_arn: &'a str,
    pub copy_options: &'a str,
    pub dedup: DedupMode,
}

fn latest_rows_insert(table: &str, staging: &str, pk: &str, ts: &str) -> String {
    format!(
        "insert into {table} with latest_rows as (select {pk}, max({ts}) as latest_time from {staging} group by {pk}) \
         select distinct o.* from {staging} o inner join latest_rows lr on o.{pk}=lr.{pk} where o.{ts}=lr.latest_time"
    )
}

fn exact_match_delete(table: &str, staging: &str, pk: &str, ts: &str) -> String {
    format!(
        "DELETE from {table} using {staging} where {table}.{pk}={staging}.{pk} and {table}.{ts}={staging}.{ts}"
    )
}

/// Statements for one coordinated load over one or more manifests.
pub fn build_load_statements(params: &LoadStatementParams<'_>) -> Vec<String> {
    let LoadStatementParams {
        table,
        staging_table: staging,
        merge_pk: pk,
        merge_timestamp: ts,
        ..
    } = *params;

    let mut sqls = Vec::with_capacity(params.manifests.len() + 5);
    sqls.push(format!("CREATE TEMP TABLE {staging} (like {table})"));

    for manifest in params.manifests {
        sqls.push(format!(
            "COPY {staging} from 's3://{}/{}' iam_role '{}' format as parquet manifest {}",
            manifest.bucket, manifest.key, params.role_arn, params.copy_options
        ));
    }

    match params.dedup {
        DedupMode::MergeDuplicatePks => {
            sqls.push(format!(
                "DELETE from {table} using {staging} where {table}.{pk}={staging}.{pk} and {table}.{ts} < {staging}.{ts}"
            ));
            sqls.push(format!(
                "DELETE from {staging} using {table} where {staging}.{pk}={table}.{pk} and {table}.{ts} >= {staging}.{ts}"
            ));
        }
        DedupMode::ExactMatch => sqls.push(exact_match_delete(table, staging, pk, ts)),
    }

    sqls.push(latest_rows_insert(table, staging, pk, ts));
    sqls.push(format!("DROP TABLE {staging}"));
    sqls
}

#[derive(Debug, Clone)]
pub struct BulkStatementParams<'a> {
    pub table: &'a str,
    pub staging_table: &'a str,
    pub merge_pk: &'a str,
    pub merge_timestamp: &'a str,
    /// Full `s3://` path, loaded directly rather than through a manifest
    pub s3_path: &'a str,
    pub role_arn: &'a str,
    pub dedup: DedupMode,
}

/// Statements for a one-shot, uncoordinated bulk load of a path.
pub fn build_bulk_statements(params: &BulkStatementParams<'_>) -> Vec<String> {
    let BulkStatementParams {
        table,
        staging_table: staging,
        merge_pk: pk,
        merge_timestamp: ts,
        ..
    } = *params;

    let mut sqls = vec![
        format!("CREATE TEMP TABLE {staging} as select * from {table} where 1=2"),
        format!(
            "COPY {staging} from '{}' iam_role '{}' format as parquet",
            params.s3_path, params.role_arn
        ),
    ];

    match params.dedup {
        // Staged rows always win in a bulk load.
        DedupMode::MergeDuplicatePks => sqls.push(format!(
            "DELETE from {table} using {staging} where {table}.{pk}={staging}.{pk}"
        )),
        DedupMode::ExactMatch => sqls.push(exact_match_delete(table, staging, pk, ts)),
    }

    sqls.push(latest_rows_insert(table, staging, pk, ts));
    sqls.push(format!("DROP TABLE {staging}"));
    sqls
}

/// Put the role back into COPY statements whose credentials were redacted.
pub fn refill_iam_role(statement: &str, role_arn: &str) -> String {
    if statement.starts_with("COPY") {
        statement.replacen("iam_role ''", &format!("iam_role '{}'", role_arn), 1)
    } else {
        statement.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROLE: &str = "arn:aws:iam::123456789012:role/copy";

    fn manifests() -> Vec<PayloadRef> {
        vec![
            PayloadRef::new("manifests", "loads/orders/a_1"),
            PayloadRef::new("manifests", "loads/orders/b_2"),
        ]
    }

    #[test]
    fn test_merge_duplicate_pks_statements() {
        let manifests = manifests();
        let sqls = build_load_statements(&LoadStatementParams {
            table: "orders",
            staging_table: "orders_1700000000000_ab12cd34",
            merge_pk: "id",
            merge_timestamp: "updated_at",
            manifests: &manifests,
            role_arn: ROLE,
            copy_options: "gzip",
            dedup: DedupMode::MergeDuplicatePks,
        });

        let staging = "orders_1700000000000_ab12cd34";
        assert_eq!(
            sqls,
            vec![
                format!("CREATE TEMP TABLE {staging} (like orders)"),
                format!("COPY {staging} from 's3://manifests/loads/orders/a_1' iam_role '{ROLE}' format as parquet manifest gzip"),
                format!("COPY {staging} from 's3://manifests/loads/orders/b_2' iam_role '{ROLE}' format as parquet manifest gzip"),
                format!("DELETE from orders using {staging} where orders.id={staging}.id and orders.updated_at < {staging}.updated_at"),
                format!("DELETE from {staging} using orders where {staging}.id=orders.id and orders.updated_at >= {staging}.updated_at"),
                format!("insert into orders with latest_rows as (select id, max(updated_at) as latest_time from {staging} group by id) select distinct o.* from {staging} o inner join latest_rows lr on o.id=lr.id where o.updated_at=lr.latest_time"),
                format!("DROP TABLE {staging}"),
            ]
        );
    }

    #[test]
    fn test_exact_match_statements() {
        let manifests = manifests();
        let sqls = build_load_statements(&LoadStatementParams {
            table: "orders",
            staging_table: "orders_1",
            merge_pk: "id",
            merge_timestamp: "ts",
            manifests: &manifests[..1],
            role_arn: ROLE,
            copy_options: "",
            dedup: DedupMode::ExactMatch,
        });

        assert_eq!(sqls.len(), 5);
        assert_eq!(
            sqls[2],
            "DELETE from orders using orders_1 where orders.id=orders_1.id and orders.ts=orders_1.ts"
        );
        assert_eq!(sqls[4], "DROP TABLE orders_1");
    }

    #[test]
    fn test_bulk_statements() {
        let sqls = build_bulk_statements(&BulkStatementParams {
            table: "events",
            staging_table: "events_42",
            merge_pk: "event_id",
            merge_timestamp: "ts",
            s3_path: "s3://lake/events/2024/",
            role_arn: ROLE,
            dedup: DedupMode::MergeDuplicatePks,
        });

        assert_eq!(sqls[0], "CREATE TEMP TABLE events_42 as select * from events where 1=2");
        assert_eq!(
            sqls[1],
            format!("COPY events_42 from 's3://lake/events/2024/' iam_role '{ROLE}' format as parquet")
        );
        assert_eq!(
            sqls[2],
            "DELETE from events using events_42 where events.event_id=events_42.event_id"
        );
        assert_eq!(sqls.last().map(String::as_str), Some("DROP TABLE events_42"));
    }

    #[test]
    fn test_refill_iam_role_only_touches_copy() {
        let copy = "COPY t_1 from 's3://b/k' iam_role '' format as parquet manifest ";
        assert_eq!(
            refill_iam_role(copy, ROLE),
            format!("COPY t_1 from 's3://b/k' iam_role '{ROLE}' format as parquet manifest ")
        );
        assert_eq!(refill_iam_role("DROP TABLE t_1", ROLE), "DROP TABLE t_1");
    }
}
