//! Vector index backed by LanceDB

use std::sync::Arc;

use arrow_array::{
    Array, FixedSizeListArray, Float32Array, Int64Array, RecordBatch, RecordBatchIterator,
    StringArray, UInt32Array,
};
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::TryStreamExt;
use lance_arrow::FixedSizeListArrayExt;
use lancedb::connect;
use lancedb::query::{ExecutableQuery, QueryBase, Select};
use lancedb::DistanceType;
use uuid::Uuid;

use super::index::{ChunkPayload, IndexHit, VectorIndex};
use crate::config::Config;
use crate::error::{Error, Result};

const TABLE_NAME: &str = "chunks";

/// Vector index using LanceDB with cosine distance
pub struct LanceIndex {
    db: lancedb::Connection,
    dimensions: usize,
}

impl LanceIndex {
    /// Open (or create) the index under the configured vector directory
    pub async fn new(config: &Config) -> Result<Self> {
        let path = config.vector_db_path();
        let uri = path
            .to_str()
            .ok_or_else(|| Error::config(format!("Vector path is not UTF-8: {:?}", path)))?;

        let db = connect(uri).execute().await.map_err(lance_err)?;

        let index = Self {
            db,
            dimensions: config.embedding_dimensions,
        };

        // Ensure table exists
        index.ensure_table().await?;

        Ok(index)
    }

    /// Get the schema for the chunks table
    fn schema(&self) -> Schema {
        Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("text", DataType::Utf8, false),
            Field::new("source_session", DataType::Utf8, false),
            Field::new("created_at_ms", DataType::Int64, false),
            Field::new("exchange_count", DataType::UInt32, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    self.dimensions as i32,
                ),
                false,
            ),
        ])
    }

    async fn ensure_table(&self) -> Result<()> {
        let tables = self.db.table_names().execute().await.map_err(lance_err)?;

        if !tables.contains(&TABLE_NAME.to_string()) {
            let schema = Arc::new(self.schema());
            let empty_batch = RecordBatch::new_empty(schema.clone());
            let reader = RecordBatchIterator::new(vec![empty_batch].into_iter().map(Ok), schema);

            self.db
                .create_table(TABLE_NAME, Box::new(reader))
                .execute()
                .await
                .map_err(lance_err)?;
        }

        Ok(())
    }

    async fn table(&self) -> Result<lancedb::Table> {
        self.db
            .open_table(TABLE_NAME)
            .execute()
            .await
            .map_err(lance_err)
    }
}

#[async_trait]
impl VectorIndex for LanceIndex {
    fn name(&self) -> &str {
        "lancedb"
    }

    async fn upsert(&self, id: Uuid, vector: &[f32], payload: &ChunkPayload) -> Result<()> {
        if vector.len() != self.dimensions {
            return Err(Error::index_unavailable(format!(
                "Embedding dimension mismatch: expected {}, got {}",
                self.dimensions,
                vector.len()
            )));
        }

        let table = self.table().await?;

        // Replace semantics: drop any previous row with this id first
        table
            .delete(&format!("id = '{}'", id))
            .await
            .map_err(lance_err)?;

        let values = Float32Array::from(vector.to_vec());
        let vector_array = FixedSizeListArray::try_new_from_values(values, self.dimensions as i32)
            .map_err(|e: arrow_schema::ArrowError| Error::index_unavailable(e.to_string()))?;

        let schema = Arc::new(self.schema());
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(StringArray::from(vec![id.to_string()])) as Arc<dyn Array>,
                Arc::new(StringArray::from(vec![payload.text.clone()])),
                Arc::new(StringArray::from(vec![payload.source_session.clone()])),
                Arc::new(Int64Array::from(vec![payload.created_at.timestamp_millis()])),
                Arc::new(UInt32Array::from(vec![payload.exchange_count])),
                Arc::new(vector_array),
            ],
        )
        .map_err(|e| Error::index_unavailable(e.to_string()))?;

        let reader = RecordBatchIterator::new(vec![batch].into_iter().map(Ok), schema);
        table
            .add(Box::new(reader))
            .execute()
            .await
            .map_err(lance_err)?;

        Ok(())
    }

    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<IndexHit>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let table = self.table().await?;
        let batches: Vec<RecordBatch> = table
            .vector_search(vector.to_vec())
            .map_err(lance_err)?
            .distance_type(DistanceType::Cosine)
            .limit(k)
            .execute()
            .await
            .map_err(lance_err)?
            .try_collect::<Vec<RecordBatch>>()
            .await
            .map_err(lance_err)?;

        let mut hits = Vec::new();
        for batch in batches {
            let ids = string_column(&batch, "id")?;
            let texts = string_column(&batch, "text")?;
            let sessions = string_column(&batch, "source_session")?;
            let created = typed_column::<Int64Array>(&batch, "created_at_ms")?;
            let counts = typed_column::<UInt32Array>(&batch, "exchange_count")?;
            let distances = typed_column::<Float32Array>(&batch, "_distance")?;

            for i in 0..batch.num_rows() {
                hits.push(IndexHit {
                    id: Uuid::parse_str(ids.value(i))
                        .map_err(|e| Error::index_unavailable(e.to_string()))?,
                    payload: ChunkPayload {
                        text: texts.value(i).to_string(),
                        created_at: millis_to_datetime(created.value(i))?,
                        source_session: sessions.value(i).to_string(),
                        exchange_count: counts.value(i),
                    },
                    // Cosine distance is 1 - cosine similarity
                    similarity: 1.0 - distances.value(i),
                });
            }
        }

        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(hits)
    }

    async fn count(&self) -> Result<usize> {
        self.table()
            .await?
            .count_rows(None)
            .await
            .map_err(lance_err)
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let table = self.table().await?;
        let before = table.count_rows(None).await.map_err(lance_err)?;
        table
            .delete(&format!("created_at_ms < {}", cutoff.timestamp_millis()))
            .await
            .map_err(lance_err)?;
        let after = table.count_rows(None).await.map_err(lance_err)?;
        Ok(before.saturating_sub(after))
    }

    async fn timestamps(&self) -> Result<Vec<DateTime<Utc>>> {
        let table = self.table().await?;
        let rows = table.count_rows(None).await.map_err(lance_err)?;
        if rows == 0 {
            return Ok(Vec::new());
        }

        let batches: Vec<RecordBatch> = table
            .query()
            .select(Select::Columns(vec!["created_at_ms".to_string()]))
            .limit(rows)
            .execute()
            .await
            .map_err(lance_err)?
            .try_collect::<Vec<RecordBatch>>()
            .await
            .map_err(lance_err)?;

        let mut stamps = Vec::with_capacity(rows);
        for batch in batches {
            let created = typed_column::<Int64Array>(&batch, "created_at_ms")?;
            for i in 0..batch.num_rows() {
                stamps.push(millis_to_datetime(created.value(i))?);
            }
        }
        Ok(stamps)
    }
}

fn lance_err(e: lancedb::Error) -> Error {
    Error::index_unavailable(e.to_string())
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    typed_column::<StringArray>(batch, name)
}

fn typed_column<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
    batch
        .column_by_name(name)
        .ok_or_else(|| Error::index_unavailable(format!("Missing {} column", name)))?
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| Error::index_unavailable(format!("{} column has unexpected type", name)))
}

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| Error::index_unavailable(format!("Invalid timestamp: {}", ms)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(text: &str) -> ChunkPayload {
        ChunkPayload {
            text: text.into(),
            created_at: Utc::now(),
            source_session: "session_lance".into(),
            exchange_count: 2,
        }
    }

    #[tokio::test]
    async fn upsert_then_query_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            embedding_dimensions: 3,
            ..Config::with_data_dir(dir.path())
        };
        config.ensure_dirs().unwrap();
        let index = LanceIndex::new(&config).await.unwrap();

        let near = Uuid::new_v4();
        let far = Uuid::new_v4();
        index.upsert(near, &[1.0, 0.0, 0.0], &payload("near")).await.unwrap();
        index.upsert(far, &[0.0, 1.0, 0.0], &payload("far")).await.unwrap();
        // Second upsert of the same id must not duplicate the row
        index.upsert(near, &[1.0, 0.0, 0.0], &payload("near")).await.unwrap();

        assert_eq!(index.count().await.unwrap(), 2);

        let hits = index.query(&[1.0, 0.0, 0.0], 2).await.unwrap();
        assert_eq!(hits[0].id, near);
        assert!((hits[0].similarity - 1.0).abs() < 1e-4);
        assert_eq!(hits[0].payload.text, "near");
    }

    #[tokio::test]
    async fn rejects_wrong_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            embedding_dimensions: 3,
            ..Config::with_data_dir(dir.path())
        };
        config.ensure_dirs().unwrap();
        let index = LanceIndex::new(&config).await.unwrap();

        let err = index
            .upsert(Uuid::new_v4(), &[1.0, 0.0], &payload("bad"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::IndexUnavailable(_)));
    }
}
