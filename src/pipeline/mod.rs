//! Pipeline stages for deck narration.
//!
//! Each submodule owns one step and the collaborator trait it calls, so a
//! stage can be driven with a fake collaborator in tests.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ convert ──▶ recognize ──▶ vision ──▶ script ──▶ synth ──▶ dispatch
//! (check)   (PDF, PNG)   (OCR pool)    (VLM)      (LLM)      (TTS)     (avatar)
//! ```
//!
//! 1. [`input`]     validate the source path and sanitise uploaded names
//! 2. [`convert`]   deck → PDF → page images, waiting on [`wait`] for files
//!    that external converters write asynchronously
//! 3. [`recognize`] per-page text on a bounded `spawn_blocking` pool
//! 4. [`vision`]    per-page image analysis; [`encode`] prepares the PNG
//! 5. [`script`]    batched narration with retry/backoff
//! 6. [`synth`]     one audio file per narrated page
//! 7. [`dispatch`]  paced pushes to the avatar

pub mod convert;
pub mod dispatch;
pub mod encode;
pub mod input;
pub mod recognize;
pub mod script;
pub mod synth;
pub mod vision;
pub mod wait;
