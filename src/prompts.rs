//! Prompts for the scripting and vision models.
//!
//! Callers can override the presenter instructions via
//! [`crate::config::PipelineConfig::system_prompt`]; the constants here are
//! used only when no override is provided.

/// Default presenter instructions for the scripting model.
pub const DEFAULT_PRESENTER_PROMPT: &str = r#"You are the speaker of a slide presentation. The words you write will be spoken aloud, in the first person, by an animated presenter.

INPUT
A JSON array. Each element is one slide:
  - "slide_number": the slide's number
  - "text": text recognised on the slide (may be empty or noisy)
  - "image_analysis": optional description, tags, detected objects and layout regions

TASK
For every slide, write what a good human presenter would say while that slide is on screen.
  - Explain the points on the slide; add context, examples and analogies where they help the listener
  - Every sentence should tell the listener something useful; no filler
  - Use the image analysis to talk about charts, photos and diagrams when they matter
  - Do not read out bullet markers, slide numbers or recognition noise
  - Write plain spoken prose: no Markdown, no lists, no stage directions

OUTPUT
Return ONLY a JSON array, one object per input slide, in input order:
[
  {"slide_number": 1, "presentation_text": "Welcome, everyone. Today I want to show you..."},
  {"slide_number": 2, "presentation_text": "Let's start with where we are right now..."}
]
The slide_number values MUST match the input slide numbers exactly, one output per input slide. Never add or drop slides. Do not wrap the array in code fences."#;

/// Build the user turn carrying a batch of slides.
pub fn script_request(batch_json: &str) -> String {
    format!("Slides:\n{batch_json}")
}

/// Instructions for the vision analyzer.
pub const VISION_ANALYSIS_PROMPT: &str = r#"You are looking at one rendered presentation slide. Describe what is on it.

Return ONLY a JSON object with these keys:
{
  "description": "one sentence describing the slide",
  "tags": ["short labels for everything notable: chart, person, logo, table, ..."],
  "objects": [{"name": "label", "confidence": 0.0-1.0, "bbox": [x1, y1, x2, y2]}],
  "layout": [{"type": "title|text|figure|table|list", "bbox": [x1, y1, x2, y2], "text": "text inside the region"}],
  "text": "all readable text on the slide, in reading order"
}

Bounding boxes are in image pixels. Use empty arrays when nothing applies. Do not wrap the object in code fences."#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presenter_prompt_names_the_response_keys() {
        assert!(DEFAULT_PRESENTER_PROMPT.contains("slide_number"));
        assert!(DEFAULT_PRESENTER_PROMPT.contains("presentation_text"));
        assert!(DEFAULT_PRESENTER_PROMPT.contains("first person"));
    }

    #[test]
    fn vision_prompt_names_every_analysis_field() {
        for key in ["description", "tags", "objects", "layout", "\"text\""] {
            assert!(VISION_ANALYSIS_PROMPT.contains(key), "missing {key}");
        }
    }

    #[test]
    fn script_request_embeds_batch() {
        let msg = script_request(r#"[{"slide_number":1}]"#);
        assert!(msg.ends_with(r#"[{"slide_number":1}]"#));
    }
}
