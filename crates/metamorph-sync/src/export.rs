use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, RecordBatch, StringArray, UInt64Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use metamorph_core::{CategoryPopularity, EnrichedTransaction, InsightSnapshot, UserSpend};
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub rows: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportSummary {
    pub run_id: Uuid,
    pub reports_dir: String,
    pub manifest_path: String,
    pub manifest: ParquetManifest,
}

/// Write the enriched set and both insight views as parquet under
/// `<workspace_root>/reports/<run_id>/snapshots/`, plus a `manifest.json`.
pub fn export_snapshots(
    workspace_root: &Path,
    run_id: Uuid,
    enriched: &[EnrichedTransaction],
    insights: &InsightSnapshot,
) -> Result<ExportSummary> {
    let reports_dir = workspace_root.join("reports").join(run_id.to_string());
    let snapshot_dir = reports_dir.join("snapshots");
    std::fs::create_dir_all(&snapshot_dir)
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let enriched_path = snapshot_dir.join("enriched_transactions.parquet");
    let spend_path = snapshot_dir.join("user_spend.parquet");
    let categories_path = snapshot_dir.join("category_popularity.parquet");
    let categories = &insights.product_popularity.product_categories;

    write_enriched_parquet(&enriched_path, enriched)?;
    write_user_spend_parquet(&spend_path, &insights.user_spend)?;
    write_category_parquet(&categories_path, categories)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        run_id,
        files: vec![
            manifest_entry("enriched_transactions", &reports_dir, &enriched_path, enriched.len())?,
            manifest_entry("user_spend", &reports_dir, &spend_path, insights.user_spend.len())?,
            manifest_entry("category_popularity", &reports_dir, &categories_path, categories.len())?,
        ],
    };

    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    std::fs::write(&manifest_path, bytes)
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    Ok(ExportSummary {
        run_id,
        reports_dir: reports_dir.display().to_string(),
        manifest_path: manifest_path.display().to_string(),
        manifest,
    })
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_enriched_parquet(path: &Path, rows: &[EnrichedTransaction]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("transaction_id", DataType::Utf8, false),
        ArrowField::new("external_id", DataType::Utf8, false),
        ArrowField::new("user_id", DataType::Utf8, false),
        ArrowField::new("user_name", DataType::Utf8, false),
        ArrowField::new("user_email", DataType::Utf8, false),
        ArrowField::new("product_id", DataType::Utf8, false),
        ArrowField::new("product_title", DataType::Utf8, false),
        ArrowField::new("product_category", DataType::Utf8, true),
        ArrowField::new("product_price", DataType::Float64, false),
        ArrowField::new("amount", DataType::Float64, true),
        ArrowField::new("quantity", DataType::Float64, true),
        ArrowField::new("status", DataType::Utf8, true),
        ArrowField::new("occurred_at", DataType::Utf8, true),
        ArrowField::new("eta", DataType::Utf8, true),
        ArrowField::new("parcel_id", DataType::Utf8, true),
        ArrowField::new("line_total", DataType::Float64, false),
    ]));

    let transaction_ids = text_column(rows, |r| Some(r.transaction_id.as_str()));
    let external_ids = text_column(rows, |r| Some(r.external_id.as_str()));
    let user_ids = text_column(rows, |r| Some(r.user.entity_id.as_str()));
    let user_names = text_column(rows, |r| Some(r.user.name.as_str()));
    let user_emails = text_column(rows, |r| Some(r.user.email.as_str()));
    let product_ids = text_column(rows, |r| Some(r.product.entity_id.as_str()));
    let product_titles = text_column(rows, |r| Some(r.product.title.as_str()));
    let product_categories = text_column(rows, |r| r.product.category.as_deref());
    let statuses = text_column(rows, |r| r.status.as_deref());
    let occurred = text_column(rows, |r| r.occurred_at.as_deref());
    let etas = text_column(rows, |r| r.eta.as_deref());
    let parcel_ids = text_column(rows, |r| r.parcel_id.as_deref());
    let prices = Float64Array::from(rows.iter().map(|r| r.product.price).collect::<Vec<_>>());
    let amounts = Float64Array::from(rows.iter().map(|r| r.amount).collect::<Vec<_>>());
    let quantities = Float64Array::from(rows.iter().map(|r| r.quantity).collect::<Vec<_>>());
    let line_totals = Float64Array::from(rows.iter().map(|r| r.line_total).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(transaction_ids),
            Arc::new(external_ids),
            Arc::new(user_ids),
            Arc::new(user_names),
            Arc::new(user_emails),
            Arc::new(product_ids),
            Arc::new(product_titles),
            Arc::new(product_categories),
            Arc::new(prices),
            Arc::new(amounts),
            Arc::new(quantities),
            Arc::new(statuses),
            Arc::new(occurred),
            Arc::new(etas),
            Arc::new(parcel_ids),
            Arc::new(line_totals),
        ],
    )
    .context("building enriched_transactions record batch")?;
    write_parquet(path, batch)
}

fn text_column(
    rows: &[EnrichedTransaction],
    f: fn(&EnrichedTransaction) -> Option<&str>,
) -> StringArray {
    StringArray::from(rows.iter().map(f).collect::<Vec<_>>())
}

fn write_user_spend_parquet(path: &Path, rows: &[UserSpend]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("user_id", DataType::Utf8, false),
        ArrowField::new("external_id", DataType::Utf8, false),
        ArrowField::new("name", DataType::Utf8, false),
        ArrowField::new("email", DataType::Utf8, false),
        ArrowField::new("total_spent", DataType::Float64, false),
        ArrowField::new("transaction_count", DataType::UInt64, false),
    ]));

    let user_ids = StringArray::from(rows.iter().map(|r| r.user_id.as_str()).collect::<Vec<_>>());
    let external_ids =
        StringArray::from(rows.iter().map(|r| r.external_id.as_str()).collect::<Vec<_>>());
    let names = StringArray::from(rows.iter().map(|r| r.name.as_str()).collect::<Vec<_>>());
    let emails = StringArray::from(rows.iter().map(|r| r.email.as_str()).collect::<Vec<_>>());
    let totals = Float64Array::from(rows.iter().map(|r| r.total_spent).collect::<Vec<_>>());
    let counts = UInt64Array::from(
        rows.iter()
            .map(|r| r.transaction_count as u64)
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(user_ids),
            Arc::new(external_ids),
            Arc::new(names),
            Arc::new(emails),
            Arc::new(totals),
            Arc::new(counts),
        ],
    )
    .context("building user_spend record batch")?;
    write_parquet(path, batch)
}

fn write_category_parquet(path: &Path, rows: &[CategoryPopularity]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("category", DataType::Utf8, false),
        ArrowField::new("transaction_count", DataType::UInt64, false),
        ArrowField::new("average_transaction_value", DataType::Float64, false),
    ]));

    let categories =
        StringArray::from(rows.iter().map(|r| r.category.as_str()).collect::<Vec<_>>());
    let counts = UInt64Array::from(
        rows.iter()
            .map(|r| r.transaction_count as u64)
            .collect::<Vec<_>>(),
    );
    let averages = Float64Array::from(
        rows.iter()
            .map(|r| r.average_transaction_value)
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![Arc::new(categories), Arc::new(counts), Arc::new(averages)],
    )
    .context("building category_popularity record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(
    name: &str,
    reports_dir: &Path,
    path: &Path,
    rows: usize,
) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
        rows,
    })
}
