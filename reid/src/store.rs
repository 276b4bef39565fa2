//! The in-memory embedding store backing global identity assignment.
use tracing::debug;
use uuid::Uuid;

/// Insertion-ordered store of `reid_id → embedding`. Lookup is cosine
/// similarity with a stable argmax: for equal inputs the same entry wins
/// on every run.
pub(crate) struct EmbeddingStore {
    entries: Vec<(String, Vec<f32>)>,
    threshold: f32,
    max_entries: usize,
}

impl EmbeddingStore {
    pub(crate) fn new(threshold: f32, max_entries: usize) -> Self {
        Self {
            entries: Vec::new(),
            threshold,
            max_entries: max_entries.max(1),
        }
    }

    /// Returns the id of the best match at or above the threshold, or
    /// allocates a fresh id and stores the embedding.
    pub(crate) fn lookup_or_insert(&mut self, embedding: &[f32]) -> String {
        let mut best: Option<(usize, f32)> = None;
        for (index, (_, candidate)) in self.entries.iter().enumerate() {
            let similarity = cosine_similarity(embedding, candidate);
            // Strict comparison keeps the earliest entry on ties.
            if best.is_none_or(|(_, best_similarity)| similarity > best_similarity) {
                best = Some((index, similarity));
            }
        }

        if let Some((index, similarity)) = best {
            if similarity >= self.threshold {
                if let Some((id, _)) = self.entries.get(index) {
                    return id.clone();
                }
            }
        }

        let id = Uuid::new_v4().to_string();
        self.entries.push((id.clone(), embedding.to_vec()));
        if self.entries.len() > self.max_entries {
            let evicted = self.entries.remove(0);
            debug!(reid_id = %evicted.0, "embedding store full, evicting oldest entry");
        }
        id
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn cosine_similarity_of_parallel_vectors_is_one() {
        assert_approx_eq!(cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]), 1.0);
        assert_approx_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
    }

    #[test]
    fn similar_embeddings_reuse_the_id() {
        let mut store = EmbeddingStore::new(0.7, 100);
        let first = store.lookup_or_insert(&[1.0, 0.0, 0.0]);
        let second = store.lookup_or_insert(&[0.99, 0.05, 0.0]);
        assert_eq!(first, second);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn dissimilar_embeddings_get_fresh_ids() {
        let mut store = EmbeddingStore::new(0.7, 100);
        let first = store.lookup_or_insert(&[1.0, 0.0]);
        let second = store.lookup_or_insert(&[0.0, 1.0]);
        assert_ne!(first, second);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn lookup_is_stable_across_repeats() {
        let mut store = EmbeddingStore::new(0.7, 100);
        store.lookup_or_insert(&[1.0, 0.0]);
        store.lookup_or_insert(&[0.0, 1.0]);
        let a = store.lookup_or_insert(&[0.9, 0.1]);
        let b = store.lookup_or_insert(&[0.9, 0.1]);
        assert_eq!(a, b);
    }

    #[test]
    fn store_evicts_oldest_beyond_the_cap() {
        let mut store = EmbeddingStore::new(0.99, 2);
        let first = store.lookup_or_insert(&[1.0, 0.0]);
        store.lookup_or_insert(&[0.0, 1.0]);
        store.lookup_or_insert(&[0.7, 0.7]);
        assert_eq!(store.len(), 2);

        // The first embedding was evicted, so it gets a new id now.
        let again = store.lookup_or_insert(&[1.0, 0.0]);
        assert_ne!(first, again);
    }
}
