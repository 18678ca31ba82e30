use crate::core::config::settings::RagSettings;

/// How many partitions a grounded turn pulls in, and how they are filtered.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetrievalPolicy {
    pub top_k_gpu: usize,
    pub top_k_cpu: usize,
    pub force_unique_section: bool,
    pub min_relevance_score: f32,
}

impl Default for RetrievalPolicy {
    fn default() -> Self {
        Self::from_settings(&RagSettings::default())
    }
}

impl RetrievalPolicy {
    pub fn from_settings(settings: &RagSettings) -> Self {
        Self {
            top_k_gpu: settings.top_k_gpu,
            top_k_cpu: settings.top_k_cpu,
            force_unique_section: settings.force_unique_section,
            min_relevance_score: settings.min_relevance_score,
        }
    }

    pub fn top_k(&self, gpu: bool) -> usize {
        if gpu {
            self.top_k_gpu
        } else {
            self.top_k_cpu
        }
    }
}
