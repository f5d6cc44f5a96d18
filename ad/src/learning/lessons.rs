//! Lesson repository - deduplicated storage of learned lessons
//!
//! Lessons are structured insights from failures. Before a new lesson is
//! persisted, the repository looks for a similar cached one and reinforces it
//! instead of storing a duplicate. Persistence and embedding are collaborator
//! seams ([`VectorStore`], [`Embedder`]); an in-memory cosine store ships for
//! standalone use and tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

/// Token-overlap threshold at which two failure descriptions are treated as
/// the same lesson
const SIMILARITY_THRESHOLD: f64 = 0.5;

/// A learned lesson from experience
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lesson {
    pub id: String,
    /// Brief summary of the lesson
    pub summary: String,
    /// The context this was learned in
    pub situation: String,
    /// The action that was taken
    pub action: String,
    /// What failed or was suboptimal
    pub what_went_wrong: String,
    /// What should be done instead
    pub better_approach: String,
    pub learned_at: DateTime<Utc>,
    /// How many times this lesson has been validated
    pub reinforcement_count: u32,
    /// Context fingerprint, when known
    #[serde(default)]
    pub context_key: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub confidence: f64,
}

impl Lesson {
    /// Create a lesson with a fresh id
    pub fn create(
        summary: &str,
        situation: &str,
        action: &str,
        what_went_wrong: &str,
        better_approach: &str,
        context_key: Option<String>,
        confidence: f64,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            summary: summary.to_string(),
            situation: situation.to_string(),
            action: action.to_string(),
            what_went_wrong: what_went_wrong.to_string(),
            better_approach: better_approach.to_string(),
            learned_at: Utc::now(),
            reinforcement_count: 0,
            context_key,
            tags: Vec::new(),
            confidence,
        }
    }

    /// Age of the lesson in days
    pub fn age_days(&self) -> f64 {
        (Utc::now() - self.learned_at).num_milliseconds() as f64 / 86_400_000.0
    }

    /// Reliability: confidence scaled by reinforcement, decayed slightly with
    /// age (reinforced lessons decay slower), floored at 0.3 of confidence
    pub fn reliability(&self) -> f64 {
        let reinforcement_factor = (0.5 + 0.1 * self.reinforcement_count as f64).min(1.0);
        let decay_rate = 0.01 / (1.0 + self.reinforcement_count as f64 * 0.5);
        let age_factor = (1.0 - decay_rate * self.age_days()).max(0.3);
        self.confidence * reinforcement_factor * age_factor
    }

    /// Mark the lesson as validated again
    pub fn reinforce(&mut self) {
        self.reinforcement_count += 1;
        self.confidence = (self.confidence + 0.05).min(1.0);
    }
}

/// Embedding seam; real deployments delegate to an embedding model
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> eyre::Result<Vec<f32>>;
}

/// Vector persistence seam; real deployments delegate to a vector database
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Upsert a record by id with its embedding and metadata
    async fn store(&self, id: &str, embedding: Vec<f32>, metadata: Value) -> eyre::Result<()>;

    /// Nearest records tagged with `memory_type`, most similar first
    async fn search(
        &self,
        query: Vec<f32>,
        top_k: usize,
        memory_type: &str,
    ) -> eyre::Result<Vec<Value>>;
}

/// Deterministic bag-of-tokens embedding over hash buckets
///
/// Good enough for similarity over short lesson texts without an external
/// model; cosine similarity reflects token overlap.
#[derive(Default)]
pub struct HashEmbedder;

const EMBED_DIM: usize = 64;

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> eyre::Result<Vec<f32>> {
        let mut vector = vec![0.0f32; EMBED_DIM];
        for token in text.to_lowercase().split_whitespace() {
            let digest = Sha256::digest(token.as_bytes());
            let mut prefix = [0u8; 8];
            prefix.copy_from_slice(&digest[..8]);
            let bucket = u64::from_be_bytes(prefix) as usize;
            vector[bucket % EMBED_DIM] += 1.0;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        Ok(vector)
    }
}

/// In-memory vector store with cosine ranking
#[derive(Default)]
pub struct MemoryVectorStore {
    records: Mutex<HashMap<String, (Vec<f32>, Value)>>,
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn store(&self, id: &str, embedding: Vec<f32>, metadata: Value) -> eyre::Result<()> {
        self.records
            .lock()
            .expect("records poisoned")
            .insert(id.to_string(), (embedding, metadata));
        Ok(())
    }

    async fn search(
        &self,
        query: Vec<f32>,
        top_k: usize,
        memory_type: &str,
    ) -> eyre::Result<Vec<Value>> {
        let records = self.records.lock().expect("records poisoned");
        let mut scored: Vec<(f32, Value)> = records
            .values()
            .filter(|(_, meta)| meta["memory_type"] == memory_type)
            .map(|(embedding, meta)| (cosine(&query, embedding), meta.clone()))
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        Ok(scored.into_iter().take(top_k).map(|(_, meta)| meta).collect())
    }
}

/// Repository statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct LessonStatistics {
    pub total_lessons: usize,
    pub avg_reinforcement: f64,
    pub avg_reliability: f64,
    pub actions_covered: usize,
    pub contexts_covered: usize,
    pub most_reinforced: Option<String>,
}

/// Stores, deduplicates, and retrieves lessons
pub struct LessonRepository {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    cache: Mutex<HashMap<String, Lesson>>,
    by_action: Mutex<HashMap<String, Vec<String>>>,
    by_context: Mutex<HashMap<String, Vec<String>>>,
}

impl Default for LessonRepository {
    fn default() -> Self {
        Self::new(Arc::new(HashEmbedder), Arc::new(MemoryVectorStore::default()))
    }
}

impl LessonRepository {
    pub fn new(embedder: Arc<dyn Embedder>, store: Arc<dyn VectorStore>) -> Self {
        Self {
            embedder,
            store,
            cache: Mutex::new(HashMap::new()),
            by_action: Mutex::new(HashMap::new()),
            by_context: Mutex::new(HashMap::new()),
        }
    }

    /// Store a lesson, merging with a similar cached one when present
    ///
    /// Returns the id the caller should reference: the existing lesson's id
    /// when a merge happened, the new lesson's otherwise.
    pub async fn store(&self, lesson: Lesson) -> eyre::Result<String> {
        if let Some(mut existing) = self.find_similar(&lesson) {
            existing.reinforce();
            self.persist(&existing).await?;
            self.cache
                .lock()
                .expect("cache poisoned")
                .insert(existing.id.clone(), existing.clone());
            debug!(id = %existing.id, "Reinforced existing lesson");
            return Ok(existing.id);
        }

        self.persist(&lesson).await?;
        let id = lesson.id.clone();
        self.index(&lesson);
        self.cache
            .lock()
            .expect("cache poisoned")
            .insert(id.clone(), lesson);
        debug!(%id, "Stored lesson");
        Ok(id)
    }

    async fn persist(&self, lesson: &Lesson) -> eyre::Result<()> {
        let text = lesson_to_text(lesson);
        let embedding = self.embedder.embed(&text).await?;
        let mut metadata = serde_json::to_value(lesson)?;
        metadata["memory_type"] = Value::String("lesson".to_string());
        self.store.store(&lesson.id, embedding, metadata).await
    }

    fn find_similar(&self, lesson: &Lesson) -> Option<Lesson> {
        let by_action = self.by_action.lock().expect("index poisoned");
        let cache = self.cache.lock().expect("cache poisoned");
        let ids = by_action.get(&lesson.action)?;
        ids.iter()
            .filter_map(|id| cache.get(id))
            .find(|cached| are_similar(lesson, cached))
            .cloned()
    }

    fn index(&self, lesson: &Lesson) {
        let mut by_action = self.by_action.lock().expect("index poisoned");
        let ids = by_action.entry(lesson.action.clone()).or_default();
        if !ids.contains(&lesson.id) {
            ids.push(lesson.id.clone());
        }
        drop(by_action);

        if let Some(context_key) = &lesson.context_key {
            let mut by_context = self.by_context.lock().expect("index poisoned");
            let ids = by_context.entry(context_key.clone()).or_default();
            if !ids.contains(&lesson.id) {
                ids.push(lesson.id.clone());
            }
        }
    }

    /// Find lessons applicable to the current situation, most reliable first
    pub async fn find_relevant(
        &self,
        context: &BTreeMap<String, Value>,
        top_k: usize,
        min_reliability: f64,
    ) -> eyre::Result<Vec<Lesson>> {
        let mut query_parts = Vec::new();
        for (key, label) in [
            ("goal", "Goal"),
            ("action", "Action"),
            ("error", "Error"),
            ("task", "Task"),
        ] {
            if let Some(value) = context.get(key) {
                query_parts.push(format!("{label}: {value}"));
            }
        }
        if query_parts.is_empty() {
            query_parts.push(serde_json::to_string(context)?);
        }
        let query = query_parts.join(" | ");

        let embedding = self.embedder.embed(&query).await?;
        let results = self.store.search(embedding, top_k * 2, "lesson").await?;

        let mut lessons = Vec::new();
        for metadata in results {
            let Ok(lesson) = serde_json::from_value::<Lesson>(metadata) else {
                continue;
            };
            if lesson.reliability() < min_reliability {
                continue;
            }
            self.index(&lesson);
            self.cache
                .lock()
                .expect("cache poisoned")
                .insert(lesson.id.clone(), lesson.clone());
            lessons.push(lesson);
        }

        lessons.sort_by(|a, b| b.reliability().total_cmp(&a.reliability()));
        lessons.truncate(top_k);
        Ok(lessons)
    }

    /// Lessons for a specific action, most reliable first
    pub fn find_by_action(&self, action: &str, top_k: usize) -> Vec<Lesson> {
        let by_action = self.by_action.lock().expect("index poisoned");
        let cache = self.cache.lock().expect("cache poisoned");
        let mut lessons: Vec<Lesson> = by_action
            .get(action)
            .into_iter()
            .flatten()
            .filter_map(|id| cache.get(id).cloned())
            .collect();
        lessons.sort_by(|a, b| b.reliability().total_cmp(&a.reliability()));
        lessons.truncate(top_k);
        lessons
    }

    /// Lessons for a context fingerprint, most reliable first
    pub fn find_by_context(&self, context_key: &str, top_k: usize) -> Vec<Lesson> {
        let by_context = self.by_context.lock().expect("index poisoned");
        let cache = self.cache.lock().expect("cache poisoned");
        let mut lessons: Vec<Lesson> = by_context
            .get(context_key)
            .into_iter()
            .flatten()
            .filter_map(|id| cache.get(id).cloned())
            .collect();
        lessons.sort_by(|a, b| b.reliability().total_cmp(&a.reliability()));
        lessons.truncate(top_k);
        lessons
    }

    /// Reinforce a lesson by id; returns false when unknown
    pub async fn reinforce_lesson(&self, lesson_id: &str) -> eyre::Result<bool> {
        let lesson = {
            let mut cache = self.cache.lock().expect("cache poisoned");
            match cache.get_mut(lesson_id) {
                Some(lesson) => {
                    lesson.reinforce();
                    lesson.clone()
                }
                None => return Ok(false),
            }
        };
        self.persist(&lesson).await?;
        debug!(id = %lesson_id, count = lesson.reinforcement_count, "Reinforced lesson");
        Ok(true)
    }

    /// Get a cached lesson by id
    pub fn get_lesson(&self, lesson_id: &str) -> Option<Lesson> {
        self.cache.lock().expect("cache poisoned").get(lesson_id).cloned()
    }

    /// All cached lessons
    pub fn get_all_lessons(&self) -> Vec<Lesson> {
        self.cache.lock().expect("cache poisoned").values().cloned().collect()
    }

    /// Cached lessons carrying a tag
    pub fn get_lessons_by_tag(&self, tag: &str) -> Vec<Lesson> {
        self.cache
            .lock()
            .expect("cache poisoned")
            .values()
            .filter(|lesson| lesson.tags.iter().any(|t| t == tag))
            .cloned()
            .collect()
    }

    /// Drop the in-memory cache and indexes; the backend is untouched
    pub fn clear_cache(&self) {
        self.cache.lock().expect("cache poisoned").clear();
        self.by_action.lock().expect("index poisoned").clear();
        self.by_context.lock().expect("index poisoned").clear();
        debug!("LessonRepository cache cleared");
    }

    /// Aggregate statistics over cached lessons
    pub fn get_statistics(&self) -> LessonStatistics {
        let cache = self.cache.lock().expect("cache poisoned");
        if cache.is_empty() {
            return LessonStatistics::default();
        }
        let lessons: Vec<&Lesson> = cache.values().collect();
        let total = lessons.len();
        LessonStatistics {
            total_lessons: total,
            avg_reinforcement: lessons
                .iter()
                .map(|l| l.reinforcement_count as f64)
                .sum::<f64>()
                / total as f64,
            avg_reliability: lessons.iter().map(|l| l.reliability()).sum::<f64>() / total as f64,
            actions_covered: self.by_action.lock().expect("index poisoned").len(),
            contexts_covered: self.by_context.lock().expect("index poisoned").len(),
            most_reinforced: lessons
                .iter()
                .max_by_key(|l| l.reinforcement_count)
                .map(|l| l.summary.clone()),
        }
    }
}

/// Two lessons merge iff the action matches, context keys (when both present)
/// match, and the failure descriptions overlap enough
fn are_similar(a: &Lesson, b: &Lesson) -> bool {
    if a.action != b.action {
        return false;
    }
    if let (Some(a_key), Some(b_key)) = (&a.context_key, &b.context_key) {
        if a_key != b_key {
            return false;
        }
    }
    jaccard(&a.what_went_wrong, &b.what_went_wrong) >= SIMILARITY_THRESHOLD
}

fn jaccard(a: &str, b: &str) -> f64 {
    let a_words: HashSet<String> = a.to_lowercase().split_whitespace().map(String::from).collect();
    let b_words: HashSet<String> = b.to_lowercase().split_whitespace().map(String::from).collect();
    let union = a_words.union(&b_words).count().max(1);
    a_words.intersection(&b_words).count() as f64 / union as f64
}

fn lesson_to_text(lesson: &Lesson) -> String {
    let mut parts = vec![
        lesson.summary.clone(),
        format!("Situation: {}", lesson.situation),
        format!("Action: {}", lesson.action),
        format!("Problem: {}", lesson.what_went_wrong),
        format!("Solution: {}", lesson.better_approach),
    ];
    if !lesson.tags.is_empty() {
        parts.push(format!("Tags: {}", lesson.tags.join(", ")));
    }
    parts.join(" | ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lesson(action: &str, what_went_wrong: &str) -> Lesson {
        Lesson::create(
            &format!("lesson about {action}"),
            "while testing",
            action,
            what_went_wrong,
            "do the other thing",
            None,
            0.7,
        )
    }

    #[test]
    fn test_reliability_fresh_lesson() {
        let lesson = lesson("post", "x y z");
        // confidence 0.7 * reinforcement_factor 0.5 * age_factor ~1.0
        assert!((lesson.reliability() - 0.35).abs() < 0.01);
    }

    #[test]
    fn test_reliability_grows_with_reinforcement() {
        let mut lesson = lesson("post", "x y z");
        let before = lesson.reliability();
        lesson.reinforce();
        assert!(lesson.reliability() > before);
        assert_eq!(lesson.reinforcement_count, 1);
        assert!((lesson.confidence - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_reinforce_monotonic_and_confidence_capped() {
        let mut lesson = lesson("post", "x y z");
        for _ in 0..20 {
            lesson.reinforce();
        }
        assert_eq!(lesson.reinforcement_count, 20);
        assert_eq!(lesson.confidence, 1.0);
    }

    #[test]
    fn test_old_lesson_decays_but_floors() {
        let mut old = lesson("post", "x y z");
        old.learned_at = Utc::now() - chrono::Duration::days(365);
        // age factor floored at 0.3
        assert!((old.reliability() - 0.7 * 0.5 * 0.3).abs() < 0.02);
    }

    #[tokio::test]
    async fn test_store_dedups_similar_lessons() {
        let repo = LessonRepository::default();
        let first = lesson("post", "x y z");
        let first_id = repo.store(first.clone()).await.unwrap();

        // Same action, 2/4 token overlap: jaccard exactly 0.5 still merges
        let second = lesson("post", "x y q");
        let merged_id = repo.store(second).await.unwrap();

        assert_eq!(merged_id, first_id);
        assert_eq!(repo.get_all_lessons().len(), 1);
        assert_eq!(repo.get_lesson(&first_id).unwrap().reinforcement_count, 1);
    }

    #[tokio::test]
    async fn test_store_keeps_distinct_lessons() {
        let repo = LessonRepository::default();
        let a = repo.store(lesson("post", "rate limit exceeded badly")).await.unwrap();
        let b = repo.store(lesson("post", "completely different words here")).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(repo.get_all_lessons().len(), 2);

        // Different action never merges
        let c = repo.store(lesson("search", "rate limit exceeded badly")).await.unwrap();
        assert_ne!(c, a);
    }

    #[tokio::test]
    async fn test_no_two_cached_lessons_similar_after_store() {
        let repo = LessonRepository::default();
        for _ in 0..5 {
            repo.store(lesson("post", "the same failure text")).await.unwrap();
        }
        let lessons = repo.get_all_lessons();
        assert_eq!(lessons.len(), 1);
        assert_eq!(lessons[0].reinforcement_count, 4);
    }

    #[tokio::test]
    async fn test_context_key_mismatch_prevents_merge() {
        let repo = LessonRepository::default();
        let mut a = lesson("post", "x y z");
        a.context_key = Some("ctx_a".to_string());
        let mut b = lesson("post", "x y z");
        b.context_key = Some("ctx_b".to_string());

        let a_id = repo.store(a).await.unwrap();
        let b_id = repo.store(b).await.unwrap();
        assert_ne!(a_id, b_id);
    }

    #[tokio::test]
    async fn test_find_by_action_and_context() {
        let repo = LessonRepository::default();
        let mut with_ctx = lesson("post", "first failure mode entirely");
        with_ctx.context_key = Some("ctx".to_string());
        repo.store(with_ctx).await.unwrap();
        repo.store(lesson("search", "other failure words completely")).await.unwrap();

        assert_eq!(repo.find_by_action("post", 5).len(), 1);
        assert_eq!(repo.find_by_action("search", 5).len(), 1);
        assert!(repo.find_by_action("unknown", 5).is_empty());
        assert_eq!(repo.find_by_context("ctx", 5).len(), 1);
        assert!(repo.find_by_context("other", 5).is_empty());
    }

    #[tokio::test]
    async fn test_find_relevant_filters_by_reliability() {
        let repo = LessonRepository::default();
        repo.store(lesson("post", "posting failed with rate limit")).await.unwrap();

        let mut context = BTreeMap::new();
        context.insert("action".to_string(), serde_json::json!("post"));
        context.insert("error".to_string(), serde_json::json!("rate limit"));

        // Fresh lesson reliability ~0.35
        let found = repo.find_relevant(&context, 5, 0.3).await.unwrap();
        assert_eq!(found.len(), 1);

        let none = repo.find_relevant(&context, 5, 0.9).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_reinforce_lesson_by_id() {
        let repo = LessonRepository::default();
        let id = repo.store(lesson("post", "some failure")).await.unwrap();

        assert!(repo.reinforce_lesson(&id).await.unwrap());
        assert!(repo.reinforce_lesson(&id).await.unwrap());
        assert_eq!(repo.get_lesson(&id).unwrap().reinforcement_count, 2);

        assert!(!repo.reinforce_lesson("missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_tags_and_statistics() {
        let repo = LessonRepository::default();
        let mut tagged = lesson("post", "alpha beta gamma delta");
        tagged.tags = vec!["social".to_string()];
        repo.store(tagged).await.unwrap();
        repo.store(lesson("search", "unrelated failure text here")).await.unwrap();

        assert_eq!(repo.get_lessons_by_tag("social").len(), 1);
        assert!(repo.get_lessons_by_tag("missing").is_empty());

        let stats = repo.get_statistics();
        assert_eq!(stats.total_lessons, 2);
        assert_eq!(stats.actions_covered, 2);
        assert!(stats.avg_reliability > 0.0);
        assert!(stats.most_reinforced.is_some());

        repo.clear_cache();
        assert_eq!(repo.get_statistics().total_lessons, 0);
    }
}
