use super::engine::PartitionSimilarity;

/// Numbered context blocks tagged with their section, then the question.
pub fn compose_grounded_prompt(query: &str, partitions: &[PartitionSimilarity]) -> String {
    let mut prompt = String::from("Context:\n");
    for (i, partition) in partitions.iter().enumerate() {
        prompt.push_str(&format!(
            "[{}] (Section: {})\n{}\n\n",
            i + 1,
            partition.section,
            partition.text.trim()
        ));
    }
    prompt.push_str("Question: ");
    prompt.push_str(query.trim());
    prompt
}
