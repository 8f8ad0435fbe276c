//! SQL text for PostgreSQL statistics views.

pub(super) const SETTINGS_QUERY: &str =
    "SELECT name, setting, vartype, min_val, max_val FROM pg_settings ORDER BY name";

pub(super) const QUERY_TYPES_QUERY: &str = r#"
    SELECT query_type, count(*)::bigint AS total
    FROM (
        SELECT
            CASE
                WHEN query LIKE 'INSERT%' THEN 'INSERT'
                WHEN query LIKE 'UPDATE%' THEN 'UPDATE'
                WHEN query LIKE 'DELETE%' THEN 'DELETE'
                WHEN query LIKE 'SELECT%' THEN 'SELECT'
                ELSE 'OTHER'
            END AS query_type
        FROM pg_stat_statements
    ) AS categorized
    GROUP BY query_type
    ORDER BY total DESC
"#;

pub(super) const TABLES_QUERY: &str = r#"
    SELECT
        relid::bigint AS relid,
        relname::text AS relname,
        COALESCE(n_live_tup, 0)::bigint AS n_live_tup,
        COALESCE(n_dead_tup, 0)::bigint AS n_dead_tup,
        COALESCE(seq_scan, 0)::bigint AS seq_scan,
        COALESCE(idx_scan, 0)::bigint AS idx_scan,
        COALESCE(n_tup_ins, 0)::bigint AS n_tup_ins,
        COALESCE(n_tup_upd, 0)::bigint AS n_tup_upd,
        COALESCE(n_tup_del, 0)::bigint AS n_tup_del,
        last_vacuum,
        last_autovacuum,
        last_analyze,
        last_autoanalyze
    FROM pg_stat_user_tables
    WHERE COALESCE(n_live_tup, 0) + COALESCE(seq_scan, 0) + COALESCE(idx_scan, 0) > 0
    ORDER BY n_live_tup DESC, COALESCE(seq_scan, 0) + COALESCE(idx_scan, 0) DESC
"#;

pub(super) const BUFFER_HIT_RATE_QUERY: &str = r#"
    SELECT
        (sum(heap_blks_hit) / NULLIF(sum(heap_blks_hit) + sum(heap_blks_read), 0))::double precision
            AS ratio
    FROM pg_statio_user_tables
"#;

pub(super) const BGWRITER_QUERY: &str = r#"
    SELECT
        checkpoints_timed::double precision AS checkpoints_timed,
        checkpoints_req::double precision AS checkpoints_req,
        checkpoint_write_time::double precision AS checkpoint_write_time,
        checkpoint_sync_time::double precision AS checkpoint_sync_time,
        buffers_checkpoint::double precision AS buffers_checkpoint,
        buffers_clean::double precision AS buffers_clean,
        maxwritten_clean::double precision AS maxwritten_clean,
        buffers_backend::double precision AS buffers_backend,
        buffers_backend_fsync::double precision AS buffers_backend_fsync,
        buffers_alloc::double precision AS buffers_alloc
    FROM pg_stat_bgwriter
"#;

pub(super) const DATABASE_QUERY: &str = r#"
    SELECT
        xact_commit::double precision AS xact_commit,
        xact_rollback::double precision AS xact_rollback,
        blks_read::double precision AS blks_read,
        blks_hit::double precision AS blks_hit,
        tup_returned::double precision AS tup_returned,
        tup_fetched::double precision AS tup_fetched,
        tup_inserted::double precision AS tup_inserted,
        tup_updated::double precision AS tup_updated,
        tup_deleted::double precision AS tup_deleted,
        conflicts::double precision AS conflicts,
        temp_files::double precision AS temp_files,
        temp_bytes::double precision AS temp_bytes,
        deadlocks::double precision AS deadlocks,
        blk_read_time::double precision AS blk_read_time,
        blk_write_time::double precision AS blk_write_time,
        COALESCE(active_time, 0)::double precision AS active_time,
        COALESCE(idle_in_transaction_time, 0)::double precision AS idle_in_transaction_time
    FROM pg_stat_database
    WHERE datname = $1
"#;

pub(super) const AUTOVACUUM_FLAGS_QUERY: &str =
    "SELECT name, setting FROM pg_settings WHERE name IN ('autovacuum', 'track_counts')";

pub(super) const AUTOVACUUM_SETTINGS_QUERY: &str =
    "SELECT name, setting FROM pg_settings WHERE category = 'Autovacuum' AND name <> 'autovacuum'";

pub(super) const RELOAD_QUERY: &str = "SELECT pg_reload_conf()";

pub(super) const CREATE_EXTENSION_QUERY: &str =
    "CREATE EXTENSION IF NOT EXISTS pg_stat_statements";

/// Table bloat estimate (heap + TOAST) for tables with complete statistics.
pub(super) const TABLE_BLOAT_QUERY: &str = r#"
    WITH constants AS (
        SELECT current_setting('block_size')::numeric AS bs, 23 AS hdr, 8 AS ma
    ),
    no_stats AS (
        SELECT table_schema, table_name,
            n_live_tup::numeric AS est_rows,
            pg_table_size(relid)::numeric AS table_size
        FROM information_schema.columns
            JOIN pg_stat_user_tables AS psut
                ON table_schema = psut.schemaname AND table_name = psut.relname
            LEFT OUTER JOIN pg_stats
                ON table_schema = pg_stats.schemaname
                AND table_name = pg_stats.tablename
                AND column_name = attname
        WHERE attname IS NULL
            AND table_schema NOT IN ('pg_catalog', 'information_schema')
        GROUP BY table_schema, table_name, relid, n_live_tup
    ),
    null_headers AS (
        SELECT
            hdr + 1 + (sum(CASE WHEN null_frac <> 0 THEN 1 ELSE 0 END) / 8) AS nullhdr,
            SUM((1 - null_frac) * avg_width) AS datawidth,
            MAX(null_frac) AS maxfracsum,
            schemaname, tablename, hdr, ma, bs
        FROM pg_stats CROSS JOIN constants
            LEFT OUTER JOIN no_stats
                ON schemaname = no_stats.table_schema AND tablename = no_stats.table_name
        WHERE schemaname NOT IN ('pg_catalog', 'information_schema')
            AND no_stats.table_name IS NULL
            AND EXISTS (
                SELECT 1 FROM information_schema.columns
                WHERE schemaname = columns.table_schema AND tablename = columns.table_name
            )
        GROUP BY schemaname, tablename, hdr, ma, bs
    ),
    data_headers AS (
        SELECT ma, bs, hdr, schemaname, tablename,
            (datawidth + (hdr + ma - (CASE WHEN hdr % ma = 0 THEN ma ELSE hdr % ma END)))::numeric AS datahdr,
            (maxfracsum * (nullhdr + ma - (CASE WHEN nullhdr % ma = 0 THEN ma ELSE nullhdr % ma END))) AS nullhdr2
        FROM null_headers
    ),
    table_estimates AS (
        SELECT schemaname, tablename, bs,
            reltuples::numeric AS est_rows, relpages * bs AS table_bytes,
            CEIL((reltuples * (datahdr + nullhdr2 + 4 + ma
                - (CASE WHEN datahdr % ma = 0 THEN ma ELSE datahdr % ma END)) / (bs - 20))) * bs
                AS expected_bytes,
            reltoastrelid
        FROM data_headers
            JOIN pg_class ON tablename = relname
            JOIN pg_namespace ON relnamespace = pg_namespace.oid AND schemaname = nspname
        WHERE pg_class.relkind = 'r'
    ),
    estimates_with_toast AS (
        SELECT schemaname, tablename, TRUE AS can_estimate, est_rows,
            table_bytes + (coalesce(toast.relpages, 0) * bs) AS table_bytes,
            expected_bytes + (ceil(coalesce(toast.reltuples, 0) / 4) * bs) AS expected_bytes
        FROM table_estimates
            LEFT OUTER JOIN pg_class AS toast
                ON table_estimates.reltoastrelid = toast.oid AND toast.relkind = 't'
    ),
    table_estimates_plus AS (
        SELECT schemaname, tablename, can_estimate, est_rows,
            CASE WHEN table_bytes > 0 THEN table_bytes::numeric ELSE NULL::numeric END AS table_bytes,
            CASE WHEN expected_bytes > 0 THEN expected_bytes::numeric ELSE NULL::numeric END AS expected_bytes,
            CASE WHEN expected_bytes > 0 AND table_bytes > 0 AND expected_bytes <= table_bytes
                THEN (table_bytes - expected_bytes)::numeric ELSE 0::numeric END AS bloat_bytes
        FROM estimates_with_toast
        UNION ALL
        SELECT table_schema, table_name, FALSE, est_rows, table_size, NULL::numeric, NULL::numeric
        FROM no_stats
    ),
    bloat_data AS (
        SELECT schemaname, tablename, can_estimate, est_rows,
            round(table_bytes / (1024 ^ 2)::numeric, 3) AS table_mb,
            round(bloat_bytes * 100 / table_bytes) AS pct_bloat,
            round(bloat_bytes / (1024::numeric ^ 2), 2) AS mb_bloat
        FROM table_estimates_plus
    )
    SELECT
        tablename::text AS tablename,
        COALESCE(est_rows, 0)::double precision AS est_rows,
        COALESCE(pct_bloat, 0)::double precision AS pct_bloat,
        COALESCE(mb_bloat, 0)::double precision AS mb_bloat,
        COALESCE(table_mb, 0)::double precision AS table_mb
    FROM bloat_data
    WHERE can_estimate IS TRUE
    ORDER BY mb_bloat DESC
"#;

/// Btree index bloat estimate.
pub(super) const INDEX_BLOAT_QUERY: &str = r#"
    WITH btree_index_atts AS (
        SELECT nspname,
            indexclass.relname AS index_name,
            indexclass.reltuples, indexclass.relpages,
            indrelid, indexrelid, indexclass.relam,
            tableclass.relname AS tablename,
            regexp_split_to_table(indkey::text, ' ')::smallint AS attnum,
            indexrelid AS index_oid
        FROM pg_index
            JOIN pg_class AS indexclass ON pg_index.indexrelid = indexclass.oid
            JOIN pg_class AS tableclass ON pg_index.indrelid = tableclass.oid
            JOIN pg_namespace ON pg_namespace.oid = indexclass.relnamespace
            JOIN pg_am ON indexclass.relam = pg_am.oid
        WHERE pg_am.amname = 'btree' AND indexclass.relpages > 0
            AND nspname NOT IN ('pg_catalog', 'information_schema')
    ),
    index_item_sizes AS (
        SELECT ind_atts.nspname, ind_atts.index_name,
            ind_atts.reltuples, ind_atts.relpages, ind_atts.relam,
            indrelid AS table_oid, index_oid,
            current_setting('block_size')::numeric AS bs,
            8 AS maxalign,
            24 AS pagehdr,
            CASE WHEN max(coalesce(pg_stats.null_frac, 0)) = 0 THEN 2 ELSE 6 END AS index_tuple_hdr,
            sum((1 - coalesce(pg_stats.null_frac, 0)) * coalesce(pg_stats.avg_width, 1024)) AS nulldatawidth
        FROM pg_attribute
            JOIN btree_index_atts AS ind_atts
                ON pg_attribute.attrelid = ind_atts.indexrelid
                AND pg_attribute.attnum = ind_atts.attnum
            JOIN pg_stats ON pg_stats.schemaname = ind_atts.nspname
                AND ((pg_stats.tablename = ind_atts.tablename
                      AND pg_stats.attname = pg_catalog.pg_get_indexdef(pg_attribute.attrelid, pg_attribute.attnum, TRUE))
                  OR (pg_stats.tablename = ind_atts.index_name
                      AND pg_stats.attname = pg_attribute.attname))
        WHERE pg_attribute.attnum > 0
        GROUP BY 1, 2, 3, 4, 5, 6, 7, 8, 9
    ),
    index_aligned_est AS (
        SELECT maxalign, bs, nspname, index_name, reltuples, relpages, relam, table_oid, index_oid,
            coalesce(ceil(reltuples * (6 + maxalign
                - CASE WHEN index_tuple_hdr % maxalign = 0 THEN maxalign ELSE index_tuple_hdr % maxalign END
                + nulldatawidth + maxalign
                - CASE WHEN nulldatawidth::integer % maxalign = 0 THEN maxalign ELSE nulldatawidth::integer % maxalign END
            )::numeric / (bs - pagehdr::numeric) + 1), 0) AS expected
        FROM index_item_sizes
    ),
    raw_bloat AS (
        SELECT pg_class.relname AS table_name, index_name,
            bs * (index_aligned_est.relpages)::bigint AS totalbytes,
            CASE WHEN index_aligned_est.relpages <= expected THEN 0
                ELSE bs * (index_aligned_est.relpages - expected)::bigint END AS wastedbytes,
            CASE WHEN index_aligned_est.relpages <= expected THEN 0
                ELSE bs * (index_aligned_est.relpages - expected)::bigint * 100
                    / (bs * (index_aligned_est.relpages)::bigint) END AS realbloat,
            pg_relation_size(index_aligned_est.table_oid) AS table_bytes,
            stat.idx_scan AS index_scans
        FROM index_aligned_est
            JOIN pg_class ON pg_class.oid = index_aligned_est.table_oid
            JOIN pg_stat_user_indexes AS stat ON index_aligned_est.index_oid = stat.indexrelid
    )
    SELECT
        table_name::text AS table_name,
        index_name::text AS index_name,
        round(realbloat)::double precision AS bloat_pct,
        round(wastedbytes / (1024 ^ 2)::numeric)::double precision AS bloat_mb,
        round(totalbytes / (1024 ^ 2)::numeric, 3)::double precision AS index_mb,
        round(table_bytes / (1024 ^ 2)::numeric, 3)::double precision AS table_mb,
        COALESCE(index_scans, 0)::double precision AS index_scans
    FROM raw_bloat
    ORDER BY bloat_pct DESC
"#;
