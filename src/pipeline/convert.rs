//! Conversion stage: source document → PDF → numbered page images.
//!
//! Both steps shell out to external tools. The office converter's exit status
//! is not trusted (LibreOffice happily exits 0 without writing anything when
//! another instance holds its profile lock), so success is judged only by the
//! PDF showing up on disk. The rasteriser's exit status *is* checked.
//!
//! Page images are named `slide_<n>.<ext>` with a 0-based `n`; the page record
//! built from `slide_<n>` has page number `n + 1`. [`page_image_path`] is the
//! single place that mapping is written down.

use crate::config::PipelineConfig;
use crate::error::{CollaboratorError, NarrateError};
use crate::state::RunContext;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Output;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// The external converter and rasteriser.
#[async_trait]
pub trait DocumentConverter: Send + Sync {
    /// Ask the converter to write `<out_dir>/<source stem>.pdf`.
    async fn to_pdf(&self, source: &Path, out_dir: &Path) -> Result<(), CollaboratorError>;

    /// Rasterise `pdf` into `<out_dir>/slide_<n>.<ext>` at `density` DPI.
    async fn rasterize(
        &self,
        pdf: &Path,
        out_dir: &Path,
        density: u32,
        ext: &str,
    ) -> Result<(), CollaboratorError>;
}

/// LibreOffice + ImageMagick, invoked as subprocesses.
#[derive(Debug, Clone)]
pub struct SubprocessConverter {
    /// Office binary. Default: `libreoffice`.
    pub office_program: String,
    /// Rasteriser binary. Default: `convert` (ImageMagick 6; use `magick` for 7).
    pub raster_program: String,
}

impl Default for SubprocessConverter {
    fn default() -> Self {
        Self {
            office_program: "libreoffice".to_string(),
            raster_program: "convert".to_string(),
        }
    }
}

#[async_trait]
impl DocumentConverter for SubprocessConverter {
    async fn to_pdf(&self, source: &Path, out_dir: &Path) -> Result<(), CollaboratorError> {
        let output = Command::new(&self.office_program)
            .arg("--headless")
            .arg("--convert-to")
            .arg("pdf")
            .arg("--outdir")
            .arg(out_dir)
            .arg(source)
            .kill_on_drop(true)
            .output()
            .await?;
        check_status(&self.office_program, output)
    }

    async fn rasterize(
        &self,
        pdf: &Path,
        out_dir: &Path,
        density: u32,
        ext: &str,
    ) -> Result<(), CollaboratorError> {
        let pattern = out_dir.join(format!("slide_%d.{ext}"));
        let output = Command::new(&self.raster_program)
            .arg("-density")
            .arg(density.to_string())
            .arg(pdf)
            .arg(&pattern)
            .kill_on_drop(true)
            .output()
            .await?;
        check_status(&self.raster_program, output)
    }
}

fn check_status(program: &str, output: Output) -> Result<(), CollaboratorError> {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stdout.trim().is_empty() {
        debug!("{} stdout: {}", program, stdout.trim());
    }
    if output.status.success() {
        if !stderr.trim().is_empty() {
            debug!("{} stderr: {}", program, stderr.trim());
        }
        Ok(())
    } else {
        Err(CollaboratorError::ProcessFailed {
            program: program.to_string(),
            status: output.status.to_string(),
            stderr: stderr.trim().to_string(),
        })
    }
}

/// `<out_dir>/<source stem>.pdf`, the file the office converter will write.
pub fn expected_pdf_path(source: &Path, out_dir: &Path) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());
    out_dir.join(format!("{stem}.pdf"))
}

/// Image path for a 1-based page number: page `n` lives in `slide_<n - 1>`.
pub fn page_image_path(image_dir: &Path, page_num: usize, ext: &str) -> PathBuf {
    image_dir.join(format!("slide_{}.{}", page_num.saturating_sub(1), ext))
}

/// One rasterised page, with its page number already assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageImage {
    /// 1-based page number (`slide_<index>` → `index + 1`).
    pub page_num: usize,
    pub path: PathBuf,
}

static RE_SLIDE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^slide_(\d+)\.([A-Za-z0-9]+)$").unwrap());

/// List `slide_<n>.<ext>` files in `dir`, ordered by `n` numerically.
///
/// Anything else in the directory (the PDF, annotated copies, stray files) is
/// ignored.
pub async fn list_page_images(dir: &Path, ext: &str) -> Result<Vec<PageImage>, NarrateError> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| NarrateError::io(dir, e))?;
    let mut pages = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| NarrateError::io(dir, e))?
    {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let Some(caps) = RE_SLIDE_NAME.captures(&name) else {
            continue;
        };
        if !caps[2].eq_ignore_ascii_case(ext) {
            continue;
        }
        let Ok(index) = caps[1].parse::<usize>() else {
            continue;
        };
        pages.push(PageImage {
            page_num: index + 1,
            path: entry.path(),
        });
    }
    pages.sort_by_key(|p| p.page_num);
    Ok(pages)
}

/// Run the office converter and wait for the PDF to materialise.
pub async fn convert_to_pdf(
    ctx: &RunContext,
    converter: &dyn DocumentConverter,
    source: &Path,
    out_dir: &Path,
    config: &PipelineConfig,
) -> Result<PathBuf, NarrateError> {
    let pdf_path = expected_pdf_path(source, out_dir);
    info!("Converting {} to PDF", source.display());

    if let Err(e) = converter.to_pdf(source, out_dir).await {
        // Not fatal by itself: only the file's presence decides.
        warn!("Office converter reported a failure: {}", e);
    }

    if ctx
        .await_file(&pdf_path, config.file_wait_timeout(), config.poll_interval())
        .await
    {
        info!("PDF ready at {}", pdf_path.display());
        Ok(pdf_path)
    } else {
        Err(NarrateError::PdfNotCreated {
            path: pdf_path,
            waited_secs: config.file_wait_timeout_secs,
        })
    }
}

/// Rasterise the PDF and enumerate the resulting page images.
pub async fn convert_pdf_to_images(
    converter: &dyn DocumentConverter,
    pdf_path: &Path,
    out_dir: &Path,
    config: &PipelineConfig,
) -> Result<Vec<PageImage>, NarrateError> {
    converter
        .rasterize(pdf_path, out_dir, config.density, &config.image_extension)
        .await
        .map_err(|e| NarrateError::RasterisationFailed {
            pdf: pdf_path.to_path_buf(),
            detail: e.to_string(),
        })?;

    let pages = list_page_images(out_dir, &config.image_extension).await?;
    if pages.is_empty() {
        return Err(NarrateError::NoPageImages {
            dir: out_dir.to_path_buf(),
        });
    }
    info!(
        "Rasterised {} into {} page images at {} DPI",
        pdf_path.display(),
        pages.len(),
        config.density
    );
    Ok(pages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::RunState;

    #[test]
    fn pdf_name_follows_source_stem() {
        let p = expected_pdf_path(Path::new("/uploads/Q3 review.pptx"), Path::new("/img/abc"));
        assert_eq!(p, PathBuf::from("/img/abc/Q3 review.pdf"));
    }

    #[test]
    fn page_numbers_map_to_zero_based_files() {
        let dir = Path::new("/img");
        assert_eq!(page_image_path(dir, 1, "png"), PathBuf::from("/img/slide_0.png"));
        assert_eq!(page_image_path(dir, 10, "png"), PathBuf::from("/img/slide_9.png"));
    }

    #[tokio::test]
    async fn images_sort_numerically_not_lexically() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "slide_10.png",
            "slide_2.png",
            "slide_0.png",
            "slide_1.png",
            "slide_1_annotated.png",
            "deck.pdf",
            "slide_3.jpg",
        ] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        let pages = list_page_images(dir.path(), "png").await.unwrap();
        let nums: Vec<usize> = pages.iter().map(|p| p.page_num).collect();
        assert_eq!(nums, vec![1, 2, 3, 11]);
        assert!(pages[3].path.ends_with("slide_10.png"));
        assert_eq!(pages[0].path, page_image_path(dir.path(), 1, "png"));
    }

    struct FakeConverter {
        write_pdf: bool,
        pages: usize,
        raster_fails: bool,
    }

    #[async_trait]
    impl DocumentConverter for FakeConverter {
        async fn to_pdf(&self, source: &Path, out_dir: &Path) -> Result<(), CollaboratorError> {
            if self.write_pdf {
                tokio::fs::write(expected_pdf_path(source, out_dir), b"%PDF-1.7").await?;
            }
            // Exit status is ignored by the stage either way.
            Err(CollaboratorError::Unavailable("profile locked".into()))
        }

        async fn rasterize(
            &self,
            _pdf: &Path,
            out_dir: &Path,
            _density: u32,
            ext: &str,
        ) -> Result<(), CollaboratorError> {
            if self.raster_fails {
                return Err(CollaboratorError::ProcessFailed {
                    program: "convert".into(),
                    status: "exit status: 1".into(),
                    stderr: "not authorized".into(),
                });
            }
            for i in 0..self.pages {
                tokio::fs::write(out_dir.join(format!("slide_{i}.{ext}")), b"png").await?;
            }
            Ok(())
        }
    }

    fn fast_config() -> PipelineConfig {
        PipelineConfig::builder()
            .file_wait_timeout_secs(0)
            .poll_interval_ms(5)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn pdf_presence_wins_over_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let state = RunState::new();
        let config = fast_config();
        let ctx = RunContext::begin(&state, &config).unwrap();
        let conv = FakeConverter {
            write_pdf: true,
            pages: 0,
            raster_fails: false,
        };
        let pdf = convert_to_pdf(&ctx, &conv, Path::new("talk.pptx"), dir.path(), &config)
            .await
            .unwrap();
        assert!(pdf.ends_with("talk.pdf"));
    }

    #[tokio::test]
    async fn missing_pdf_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let state = RunState::new();
        let config = fast_config();
        let ctx = RunContext::begin(&state, &config).unwrap();
        let conv = FakeConverter {
            write_pdf: false,
            pages: 0,
            raster_fails: false,
        };
        let err = convert_to_pdf(&ctx, &conv, Path::new("talk.pptx"), dir.path(), &config)
            .await
            .unwrap_err();
        assert!(matches!(err, NarrateError::PdfNotCreated { .. }));
    }

    #[tokio::test]
    async fn rasteriser_failure_and_empty_output_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = fast_config();
        let pdf = dir.path().join("talk.pdf");

        let failing = FakeConverter {
            write_pdf: false,
            pages: 0,
            raster_fails: true,
        };
        let err = convert_pdf_to_images(&failing, &pdf, dir.path(), &config)
            .await
            .unwrap_err();
        assert!(matches!(err, NarrateError::RasterisationFailed { .. }));

        let empty = FakeConverter {
            write_pdf: false,
            pages: 0,
            raster_fails: false,
        };
        let err = convert_pdf_to_images(&empty, &pdf, dir.path(), &config)
            .await
            .unwrap_err();
        assert!(matches!(err, NarrateError::NoPageImages { .. }));

        let ok = FakeConverter {
            write_pdf: false,
            pages: 3,
            raster_fails: false,
        };
        let pages = convert_pdf_to_images(&ok, &pdf, dir.path(), &config)
            .await
            .unwrap();
        assert_eq!(pages.len(), 3);
        assert_eq!(pages[2].page_num, 3);
    }
}
