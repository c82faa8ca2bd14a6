use std::path::Path;

use anyhow::{Context, anyhow};
use duckdb::Connection;
use tantivy::collector::TopDocs;
use tantivy::directory::MmapDirectory;
use tantivy::query::QueryParser;
use tantivy::schema::{Field, NumericOptions, Schema, TEXT, Value};
use tantivy::{DocAddress, Index, IndexReader, Score, TantivyDocument};

const SUCCESS_MARKER: &str = "_SUCCESS";

/// Relevance search over facility names. One document per trial; the trial id
/// is the only stored field, the DuckDB store stays authoritative for the
/// projection.
#[derive(Clone)]
pub struct FacilityEngine {
    reader: IndexReader,
    trial_id: Field,
    query_parser: QueryParser,
}

impl FacilityEngine {
    pub fn open(index_dir: &Path) -> anyhow::Result<Self> {
        let dir = MmapDirectory::open(index_dir)
            .with_context(|| format!("open index dir {}", index_dir.display()))?;
        let index = Index::open(dir).context("open tantivy index")?;
        let schema = index.schema();
        let trial_id = schema.get_field("trial_id")?;
        let facility = schema.get_field("facility")?;

        let reader = index.reader().context("create index reader")?;
        let query_parser = QueryParser::for_index(&index, vec![facility]);

        Ok(Self {
            reader,
            trial_id,
            query_parser,
        })
    }

    /// Trial ids ranked by text relevance. An empty or whitespace-only query
    /// returns empty without touching the index.
    pub fn search(&self, q: &str, limit: usize) -> anyhow::Result<Vec<i64>> {
        let q = q.trim();
        if q.is_empty() {
            return Ok(Vec::new());
        }
        let limit = limit.clamp(1, 100);

        // Lenient parse: user input is free text, not query syntax.
        let (query, _errors) = self.query_parser.parse_query_lenient(q);
        let searcher = self.reader.searcher();
        let top_docs: Vec<(Score, DocAddress)> = searcher
            .search(&query, &TopDocs::with_limit(limit))
            .context("facility search")?;

        let mut out = Vec::with_capacity(top_docs.len());
        for (_score, addr) in top_docs {
            let doc: TantivyDocument = searcher.doc(addr)?;
            let id = doc
                .get_first(self.trial_id)
                .and_then(|v| v.as_i64())
                .ok_or_else(|| anyhow!("missing trial_id in doc"))?;
            out.push(id);
        }
        Ok(out)
    }
}

pub fn index_complete(index_dir: &Path) -> bool {
    index_dir.join(SUCCESS_MARKER).exists()
}

/// Rebuild the facility index from the store. Always a full rebuild: imports
/// replace the store wholesale, so there is nothing incremental to keep.
pub fn build_facility_index(conn: &Connection, index_dir: &Path) -> anyhow::Result<()> {
    if index_dir.exists() {
        std::fs::remove_dir_all(index_dir)
            .with_context(|| format!("remove {}", index_dir.display()))?;
    }
    std::fs::create_dir_all(index_dir)
        .with_context(|| format!("mkdir {}", index_dir.display()))?;

    let schema = facility_schema();
    let index = Index::create_in_dir(index_dir, schema).context("create facility index")?;
    let mut writer = index
        .writer_with_num_threads(2, 64_000_000)
        .context("create index writer")?;

    let schema = index.schema();
    let trial_id_f = schema.get_field("trial_id")?;
    let facility_f = schema.get_field("facility")?;

    let mut stmt = conn
        .prepare("SELECT trial_id, facility FROM trial_locations ORDER BY trial_id ASC, position ASC")
        .context("prepare trial_locations scan")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<usize, i64>(0)?, row.get::<usize, String>(1)?))
    })?;

    // Rows arrive grouped by trial; fold consecutive facilities into one doc.
    let mut count: u64 = 0;
    let mut current: Option<(i64, TantivyDocument)> = None;
    for r in rows {
        let (id, facility) = r?;
        match current.as_mut() {
            Some((cur_id, doc)) if *cur_id == id => doc.add_text(facility_f, &facility),
            _ => {
                if let Some((_, doc)) = current.take() {
                    writer.add_document(doc)?;
                    count += 1;
                }
                let mut doc = tantivy::doc!();
                doc.add_i64(trial_id_f, id);
                doc.add_text(facility_f, &facility);
                current = Some((id, doc));
            }
        }
    }
    if let Some((_, doc)) = current.take() {
        writer.add_document(doc)?;
        count += 1;
    }

    tracing::info!("Committing facility index ({} trials)...", count);
    writer.commit().context("commit facility index")?;

    let _ = std::fs::write(index_dir.join(SUCCESS_MARKER), "ok\n");
    Ok(())
}

fn facility_schema() -> Schema {
    let mut b = Schema::builder();
    let id_opts = NumericOptions::default().set_indexed().set_stored();
    b.add_i64_field("trial_id", id_opts);
    b.add_text_field("facility", TEXT);
    b.build()
}
