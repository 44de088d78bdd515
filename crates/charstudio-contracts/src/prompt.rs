use crate::records::Genre;

/// Longest prompt the inference endpoint is sent; longer prompts are cut.
pub const MAX_PROMPT_CHARS: usize = 300;

const PROMPT_SUFFIX: &str = "white background, character design, high quality";

pub fn build_pose_prompt(character_name: &str, pose_description: &str, genre: Genre) -> String {
    format!(
        "full body {character_name} character, {pose_description}, {} pose, {PROMPT_SUFFIX}",
        genre.as_str()
    )
}

pub fn truncate_prompt(prompt: &str, max_chars: usize) -> String {
    if prompt.chars().count() <= max_chars {
        return prompt.to_string();
    }
    prompt.chars().take(max_chars).collect()
}
