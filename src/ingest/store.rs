//! Transactional writes of an ingestion plan.

use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder};
use std::collections::HashSet;

use super::{
    normalize::{ContactUpdate, Flag, MasterRecord, RenewalImport},
    retry::{run_in_savepoint, RetryPolicy},
    IngestPlan, IngestStats,
};
use crate::config::TableNames;

/// Renewal rows per INSERT statement.
pub const RENEWAL_CHUNK_SIZE: usize = 500;

/// Postgres accepts at most this many bind parameters per statement.
pub const BIND_LIMIT: usize = 65_535;

const MASTER_BINDS: usize = 11;
const FLAG_BINDS: usize = 4;

/// Flag rows per INSERT statement.
pub const FLAG_CHUNK_SIZE: usize = BIND_LIMIT / FLAG_BINDS;

/// Masters per savepoint: the configured size, kept under the bind limit.
pub fn master_batch_size(requested: usize) -> usize {
    requested.clamp(1, BIND_LIMIT / MASTER_BINDS)
}

#[derive(Debug, Default, Clone, Copy)]
struct MasterCounts {
    base: u64,
    assets: u64,
    documents: u64,
}

/// Write `plan` in a single transaction. Any error rolls everything back.
pub async fn apply(
    pool: &PgPool,
    tables: &TableNames,
    policy: &RetryPolicy,
    batch_size: usize,
    plan: IngestPlan,
) -> Result<IngestStats, sqlx::Error> {
    let mut stats = IngestStats::default();
    let mut tx = pool.begin().await?;

    let batch_size = master_batch_size(batch_size);
    for (index, chunk) in plan.masters.chunks(batch_size).enumerate() {
        let chunk = chunk.to_vec();
        let label = format!("master#{}", index);
        let counts = run_in_savepoint(&mut tx, policy, &label, move |conn| {
            let tables = tables.clone();
            let chunk = chunk.clone();
            Box::pin(async move { write_masters(conn, &tables, &chunk).await })
        })
        .await?;
        stats.base += counts.base;
        stats.assets += counts.assets;
        stats.documents += counts.documents;
    }

    let delete_renewals = format!("DELETE FROM {}", tables.renewals);
    run_in_savepoint(&mut tx, policy, "renewals:clear", move |conn| {
        let sql = delete_renewals.clone();
        Box::pin(async move { sqlx::query(&sql).execute(&mut *conn).await.map(|_| ()) })
    })
    .await?;

    let candidates: Vec<i64> = plan
        .renewals
        .iter()
        .flat_map(|r| std::iter::once(r.signature_id).chain(r.nuova_emissione_id))
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    let known: HashSet<i64> = if candidates.is_empty() {
        HashSet::new()
    } else {
        let sql = format!("SELECT id FROM {} WHERE id = ANY($1)", tables.base);
        run_in_savepoint(&mut tx, policy, "renewals:known", move |conn| {
            let sql = sql.clone();
            let candidates = candidates.clone();
            Box::pin(async move {
                sqlx::query_scalar::<_, i64>(&sql)
                    .bind(&candidates)
                    .fetch_all(&mut *conn)
                    .await
            })
        })
        .await?
        .into_iter()
        .collect()
    };

    let (renewals, skipped) = retain_known(plan.renewals, &known);
    stats.skipped_renewals = skipped as u64;
    if skipped > 0 {
        tracing::warn!(skipped, "Renewal rows reference unknown signatures and were skipped");
    }

    for (index, chunk) in renewals.chunks(RENEWAL_CHUNK_SIZE).enumerate() {
        let chunk = chunk.to_vec();
        let label = format!("renewals#{}", index);
        stats.renewals_inserted += run_in_savepoint(&mut tx, policy, &label, move |conn| {
            let tables = tables.clone();
            let chunk = chunk.clone();
            Box::pin(async move { insert_renewals(conn, &tables, &chunk).await })
        })
        .await?;
    }

    for (index, chunk) in plan.contacts.chunks(batch_size).enumerate() {
        let chunk = chunk.to_vec();
        let label = format!("contacts#{}", index);
        stats.contacts_updated += run_in_savepoint(&mut tx, policy, &label, move |conn| {
            let tables = tables.clone();
            let chunk = chunk.clone();
            Box::pin(async move { update_contacts(conn, &tables, &chunk).await })
        })
        .await?;
    }

    tx.commit().await?;
    Ok(stats)
}

/// Drop renewals of unknown signatures and clear references to unknown ids.
pub fn retain_known(
    renewals: Vec<RenewalImport>,
    known: &HashSet<i64>,
) -> (Vec<RenewalImport>, usize) {
    let total = renewals.len();
    let kept: Vec<RenewalImport> = renewals
        .into_iter()
        .filter(|r| known.contains(&r.signature_id))
        .map(|mut r| {
            if r.nuova_emissione_id.is_some_and(|id| !known.contains(&id)) {
                r.nuova_emissione_id = None;
            }
            r
        })
        .collect();
    let skipped = total - kept.len();
    (kept, skipped)
}

async fn write_masters(
    conn: &mut PgConnection,
    tables: &TableNames,
    records: &[MasterRecord],
) -> Result<MasterCounts, sqlx::Error> {
    if records.is_empty() {
        return Ok(MasterCounts::default());
    }

    let mut upsert: QueryBuilder<Postgres> = QueryBuilder::new(format!(
        "INSERT INTO {} (id, titolare, data_emissione, emesso_da, costo_ie, importo_ie, \
         fattura_numero, fattura_tipo_invio, fattura_tipo_pagamento, fattura_data_pagamento, note) ",
        tables.base
    ));
    upsert.push_values(records, |mut row, record| {
        let s = &record.signature;
        row.push_bind(s.id)
            .push_bind(s.titolare.clone())
            .push_bind(s.data_emissione)
            .push_bind(s.emesso_da.clone())
            .push_bind(s.costo_ie)
            .push_bind(s.importo_ie)
            .push_bind(s.fattura_numero.clone())
            .push_bind(s.fattura_tipo_invio.clone())
            .push_bind(s.fattura_tipo_pagamento.clone())
            .push_bind(s.fattura_data_pagamento)
            .push_bind(s.note.clone());
    });
    upsert.push(format!(
        " ON CONFLICT (id) DO UPDATE SET \
         titolare = EXCLUDED.titolare, \
         data_emissione = EXCLUDED.data_emissione, \
         emesso_da = EXCLUDED.emesso_da, \
         costo_ie = EXCLUDED.costo_ie, \
         importo_ie = EXCLUDED.importo_ie, \
         fattura_numero = EXCLUDED.fattura_numero, \
         fattura_tipo_invio = EXCLUDED.fattura_tipo_invio, \
         fattura_tipo_pagamento = EXCLUDED.fattura_tipo_pagamento, \
         fattura_data_pagamento = COALESCE(EXCLUDED.fattura_data_pagamento, {base}.fattura_data_pagamento), \
         note = EXCLUDED.note, \
         updated_at = now()",
        base = tables.base
    ));
    let base = upsert.build().execute(&mut *conn).await?.rows_affected();

    let ids: Vec<i64> = records.iter().map(|r| r.signature.id).collect();

    sqlx::query(&format!("DELETE FROM {} WHERE signature_id = ANY($1)", tables.assets))
        .bind(&ids)
        .execute(&mut *conn)
        .await?;
    let assets = insert_flags(conn, &tables.assets, flag_rows(records, |r| &r.assets)).await?;

    sqlx::query(&format!("DELETE FROM {} WHERE signature_id = ANY($1)", tables.documents))
        .bind(&ids)
        .execute(&mut *conn)
        .await?;
    let documents =
        insert_flags(conn, &tables.documents, flag_rows(records, |r| &r.documents)).await?;

    Ok(MasterCounts {
        base,
        assets,
        documents,
    })
}

fn flag_rows(
    records: &[MasterRecord],
    flags: impl Fn(&MasterRecord) -> &Vec<Flag>,
) -> Vec<(i64, Flag)> {
    records
        .iter()
        .flat_map(|r| flags(r).iter().map(move |f| (r.signature.id, *f)))
        .collect()
}

pub(crate) async fn insert_flags(
    conn: &mut PgConnection,
    table: &str,
    rows: Vec<(i64, Flag)>,
) -> Result<u64, sqlx::Error> {
    let mut inserted = 0;
    for chunk in rows.chunks(FLAG_CHUNK_SIZE) {
        let mut insert: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "INSERT INTO {} (signature_id, category, subtype, has_item) ",
            table
        ));
        insert.push_values(chunk, |mut row, (id, flag)| {
            row.push_bind(*id)
                .push_bind(flag.kind.category)
                .push_bind(flag.kind.subtype)
                .push_bind(flag.has_item);
        });
        inserted += insert.build().execute(&mut *conn).await?.rows_affected();
    }
    Ok(inserted)
}

async fn insert_renewals(
    conn: &mut PgConnection,
    tables: &TableNames,
    renewals: &[RenewalImport],
) -> Result<u64, sqlx::Error> {
    if renewals.is_empty() {
        return Ok(0);
    }
    let mut insert: QueryBuilder<Postgres> = QueryBuilder::new(format!(
        "INSERT INTO {} (signature_id, sheet_name, email, recapito_telefonico, \
         certificato_cns_l, certificato_cns, certificato_cfd, certificato_cfd_r, \
         data_emissione, data_scadenza, rinnovo_data, rinnovo_da, nuova_emissione_id, \
         costo_ie, importo_ie, fattura_numero, fattura_tipo_invio, fattura_tipo_pagamento, \
         fattura_data_pagamento, note) ",
        tables.renewals
    ));
    insert.push_values(renewals, |mut row, r| {
        row.push_bind(r.signature_id)
            .push_bind(r.sheet_name.clone())
            .push_bind(r.email.clone())
            .push_bind(r.recapito_telefonico.clone())
            .push_bind(r.certificato_cns_l)
            .push_bind(r.certificato_cns)
            .push_bind(r.certificato_cfd)
            .push_bind(r.certificato_cfd_r)
            .push_bind(r.data_emissione)
            .push_bind(r.data_scadenza)
            .push_bind(r.rinnovo_data)
            .push_bind(r.rinnovo_da.clone())
            .push_bind(r.nuova_emissione_id)
            .push_bind(r.costo_ie)
            .push_bind(r.importo_ie)
            .push_bind(r.fattura_numero.clone())
            .push_bind(r.fattura_tipo_invio.clone())
            .push_bind(r.fattura_tipo_pagamento.clone())
            .push_bind(r.fattura_data_pagamento)
            .push_bind(r.note.clone());
    });
    Ok(insert.build().execute(&mut *conn).await?.rows_affected())
}

async fn update_contacts(
    conn: &mut PgConnection,
    tables: &TableNames,
    contacts: &[ContactUpdate],
) -> Result<u64, sqlx::Error> {
    if contacts.is_empty() {
        return Ok(0);
    }
    let mut update: QueryBuilder<Postgres> = QueryBuilder::new(format!(
        "UPDATE {} AS s SET \
         email = COALESCE(v.email, s.email), \
         recapito_telefonico = COALESCE(v.phone, s.recapito_telefonico), \
         updated_at = now() \
         FROM (",
        tables.base
    ));
    update.push_values(contacts, |mut row, c| {
        row.push_bind(c.id)
            .push_bind(c.email.clone())
            .push_bind(c.recapito_telefonico.clone());
    });
    update.push(") AS v(id, email, phone) WHERE s.id = v.id");
    Ok(update.build().execute(&mut *conn).await?.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        catalog::{self, ASSET_CATALOG, DOCUMENT_CATALOG},
        db::{schema_statements, test_pool},
        ingest::normalize::SignatureImport,
    };
    use chrono::NaiveDate;
    use std::time::Duration;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn master(id: i64, titolare: &str) -> MasterRecord {
        MasterRecord {
            signature: SignatureImport {
                id,
                titolare: titolare.to_string(),
                data_emissione: Some(ymd(2024, 3, 1)),
                emesso_da: Some("Ufficio".to_string()),
                costo_ie: Some(10.0),
                importo_ie: Some(12.2),
                fattura_numero: Some(format!("F{id}")),
                fattura_tipo_invio: None,
                fattura_tipo_pagamento: None,
                fattura_data_pagamento: None,
                note: None,
            },
            assets: catalog::all_kinds(ASSET_CATALOG)
                .map(|kind| Flag {
                    kind,
                    has_item: kind.category == "KIT" && kind.subtype == "STD",
                })
                .collect(),
            documents: catalog::all_kinds(DOCUMENT_CATALOG)
                .map(|kind| Flag {
                    kind,
                    has_item: false,
                })
                .collect(),
        }
    }

    fn renewal(signature_id: i64, email: Option<&str>) -> RenewalImport {
        RenewalImport {
            signature_id,
            sheet_name: "Rinnovi 2025".to_string(),
            email: email.map(str::to_string),
            data_scadenza: Some(ymd(2027, 3, 1)),
            ..Default::default()
        }
    }

    fn fast_retries() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    /// Fresh signature tables with a unique prefix.
    async fn scratch_tables(pool: &PgPool) -> TableNames {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let base = format!("firme_test_{}", &suffix[..12]);
        let tables = TableNames {
            assets: format!("{base}_assets"),
            documents: format!("{base}_documents"),
            renewals: format!("{base}_renewals"),
            base,
        };
        for statement in schema_statements(&tables)
            .into_iter()
            .filter(|s| s.contains(&tables.base))
        {
            sqlx::query(&statement).execute(pool).await.unwrap();
        }
        tables
    }

    async fn drop_tables(pool: &PgPool, tables: &TableNames) {
        sqlx::query(&format!(
            "DROP TABLE IF EXISTS {}, {}, {}, {} CASCADE",
            tables.renewals, tables.documents, tables.assets, tables.base
        ))
        .execute(pool)
        .await
        .unwrap();
    }

    async fn count(pool: &PgPool, table: &str) -> i64 {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(pool)
            .await
            .unwrap()
    }

    fn first_import() -> IngestPlan {
        IngestPlan {
            masters: vec![master(1, "Rossi"), master(2, "Bianchi")],
            renewals: vec![renewal(1, Some("rossi@example.it")), renewal(99, None)],
            contacts: vec![ContactUpdate {
                id: 1,
                email: Some("rossi@example.it".to_string()),
                recapito_telefonico: None,
            }],
        }
    }

    #[test]
    fn test_batches_stay_under_bind_limit() {
        assert_eq!(master_batch_size(0), 1);
        assert_eq!(master_batch_size(200), 200);
        assert!(master_batch_size(100_000) * MASTER_BINDS <= BIND_LIMIT);
        assert!(FLAG_CHUNK_SIZE * FLAG_BINDS <= BIND_LIMIT);
    }

    #[test]
    fn test_flag_rows_pair_each_flag_with_its_signature() {
        let rows = flag_rows(&[master(1, "Rossi"), master(2, "Bianchi")], |r| &r.documents);
        assert_eq!(rows.len(), 6);
        assert!(rows[..3].iter().all(|(id, _)| *id == 1));
        assert!(rows[3..].iter().all(|(id, _)| *id == 2));
    }

    #[tokio::test]
    async fn test_reimport_keeps_paid_contacts_and_payment_date() {
        let Some(pool) = test_pool().await else {
            return;
        };
        let tables = scratch_tables(&pool).await;
        let policy = fast_retries();

        let stats = apply(&pool, &tables, &policy, 200, first_import()).await.unwrap();
        assert_eq!(
            stats,
            IngestStats {
                base: 2,
                assets: 26,
                documents: 6,
                contacts_updated: 1,
                renewals_inserted: 1,
                skipped_renewals: 1,
            }
        );

        sqlx::query(&format!(
            "UPDATE {} SET paid = true, fattura_data_pagamento = $1 WHERE id = 1",
            tables.base
        ))
        .bind(ymd(2026, 1, 15))
        .execute(&pool)
        .await
        .unwrap();

        let second = IngestPlan {
            masters: vec![master(1, "Rossi Mario")],
            ..Default::default()
        };
        apply(&pool, &tables, &policy, 200, second).await.unwrap();

        let (titolare, paid, email, payment): (String, bool, Option<String>, Option<NaiveDate>) =
            sqlx::query_as(&format!(
                "SELECT titolare, paid, email, fattura_data_pagamento FROM {} WHERE id = 1",
                tables.base
            ))
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(titolare, "Rossi Mario");
        assert!(paid);
        assert_eq!(email.as_deref(), Some("rossi@example.it"));
        assert_eq!(payment, Some(ymd(2026, 1, 15)));
        assert_eq!(count(&pool, &tables.renewals).await, 0);
        assert_eq!(count(&pool, &tables.assets).await, 26);

        drop_tables(&pool, &tables).await;
    }

    #[tokio::test]
    async fn test_failed_import_leaves_previous_data() {
        let Some(pool) = test_pool().await else {
            return;
        };
        let tables = scratch_tables(&pool).await;
        let policy = fast_retries();
        apply(&pool, &tables, &policy, 200, first_import()).await.unwrap();

        // The second batch upserts id 2 twice in one statement and fails.
        let broken = IngestPlan {
            masters: vec![
                master(1, "Nuovo"),
                master(3, "Verdi"),
                master(2, "Gialli"),
                master(2, "Neri"),
            ],
            renewals: vec![renewal(3, None)],
            ..Default::default()
        };
        assert!(apply(&pool, &tables, &policy, 2, broken).await.is_err());

        let titolare: String = sqlx::query_scalar(&format!(
            "SELECT titolare FROM {} WHERE id = 1",
            tables.base
        ))
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(titolare, "Rossi");
        assert_eq!(count(&pool, &tables.base).await, 2);
        assert_eq!(count(&pool, &tables.renewals).await, 1);

        drop_tables(&pool, &tables).await;
    }

    #[tokio::test]
    async fn test_large_batches_split_flag_inserts() {
        let Some(pool) = test_pool().await else {
            return;
        };
        let tables = scratch_tables(&pool).await;
        let plan = IngestPlan {
            masters: (1..=1400).map(|id| master(id, "Bulk")).collect(),
            ..Default::default()
        };

        let stats = apply(&pool, &tables, &fast_retries(), 1400, plan).await.unwrap();
        assert_eq!(stats.base, 1400);
        assert_eq!(stats.assets, 1400 * 13);
        assert_eq!(stats.documents, 1400 * 3);

        drop_tables(&pool, &tables).await;
    }

    #[test]
    fn test_retain_known_drops_orphans_and_clears_unknown_references() {
        let renewals = vec![
            RenewalImport {
                signature_id: 1,
                nuova_emissione_id: Some(2),
                ..Default::default()
            },
            RenewalImport {
                signature_id: 1,
                nuova_emissione_id: Some(99),
                ..Default::default()
            },
            RenewalImport {
                signature_id: 42,
                ..Default::default()
            },
        ];
        let known: HashSet<i64> = [1, 2].into_iter().collect();

        let (kept, skipped) = retain_known(renewals, &known);
        assert_eq!(skipped, 1);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].nuova_emissione_id, Some(2));
        assert_eq!(kept[1].nuova_emissione_id, None);
    }
}
