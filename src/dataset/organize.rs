//! 生データを `<output>/{train,val}/<クラス名>/` に整理する
//!
//! - HAM10000: メタデータCSVの `dx` で層化分割し、`<image_id>.jpg` としてコピー
//! - 追加疾患: `common_dir` のサブフォルダ名をクラス名として分割・コピー

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use crate::csv_loader::load_metadata_csv;
use crate::dataset::{ham_label, stratified_split};
use crate::model::DatasetSettings;
use crate::types::Split;

const COMMON_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// 整理結果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrganizeReport {
    /// クラス名 → 学習用の枚数
    pub train: BTreeMap<String, usize>,
    /// クラス名 → 検証用の枚数
    pub val: BTreeMap<String, usize>,
    /// CSVにあるが画像が見つからなかった件数
    pub missing_images: usize,
    pub ham_processed: bool,
    pub common_classes: Vec<String>,
}

impl OrganizeReport {
    pub fn total(&self, split: Split) -> usize {
        self.counts(split).values().sum()
    }

    pub fn counts(&self, split: Split) -> &BTreeMap<String, usize> {
        match split {
            Split::Train => &self.train,
            Split::Val => &self.val,
        }
    }

    fn record(&mut self, split: Split, label: &str) {
        let counts = match split {
            Split::Train => &mut self.train,
            Split::Val => &mut self.val,
        };
        *counts.entry(label.to_string()).or_insert(0) += 1;
    }
}

/// コピー1件分
struct CopyJob {
    src: PathBuf,
    split: Split,
    label: String,
    file_name: String,
}

/// データセットを整理
pub fn organize(settings: &DatasetSettings) -> Result<OrganizeReport> {
    let output = Path::new(&settings.output_dir);
    setup_directories(output, settings.clean_output)?;

    let mut report = OrganizeReport::default();
    process_ham10000(settings, output, &mut report)?;
    process_common_diseases(settings, output, &mut report)?;

    info!(
        "整理完了: {} (学習 {} 枚, 検証 {} 枚)",
        output.display(),
        report.total(Split::Train),
        report.total(Split::Val)
    );
    Ok(report)
}

fn setup_directories(output: &Path, clean: bool) -> Result<()> {
    if clean && output.exists() {
        info!("既存の整理済みデータを削除します: {}", output.display());
        std::fs::remove_dir_all(output)
            .with_context(|| format!("Failed to remove {}", output.display()))?;
    }
    for split in Split::ALL {
        let dir = output.join(split.dir_name());
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    Ok(())
}

/// `.jpg` を再帰的に探索し、ファイル名（拡張子なし）→ パス の対応を作る
fn index_images(dir: &Path, index: &mut HashMap<String, PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory: {}", dir.display()))?
    {
        let path = entry?.path();
        if path.is_dir() {
            index_images(&path, index)?;
        } else if path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("jpg"))
            .unwrap_or(false)
        {
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                index.insert(stem.to_string(), path.clone());
            }
        }
    }
    Ok(())
}

fn process_ham10000(settings: &DatasetSettings, output: &Path, report: &mut OrganizeReport) -> Result<()> {
    let metadata_path = settings.metadata_path();
    if !metadata_path.exists() {
        warn!("メタデータCSVが見つかりません。HAM10000をスキップします: {}", metadata_path.display());
        return Ok(());
    }

    let records = load_metadata_csv(&metadata_path)?;
    let mut image_paths = HashMap::new();
    index_images(Path::new(&settings.ham_dir), &mut image_paths)?;
    info!("HAM10000: {} 件のメタデータ, {} 枚の画像", records.len(), image_paths.len());

    let (train, val) = stratified_split(records, |r| r.dx.clone(), settings.val_ratio, settings.seed);

    let mut jobs = Vec::new();
    for (split, rows) in [(Split::Train, train), (Split::Val, val)] {
        for row in rows {
            match image_paths.get(&row.image_id) {
                Some(src) => jobs.push(CopyJob {
                    src: src.clone(),
                    split,
                    label: ham_label(&row.dx),
                    file_name: format!("{}.jpg", row.image_id),
                }),
                None => report.missing_images += 1,
            }
        }
    }

    if report.missing_images > 0 {
        warn!("画像が見つからない行: {} 件", report.missing_images);
    }

    copy_files(jobs, output, "HAM10000", report)?;
    report.ham_processed = true;
    Ok(())
}

fn process_common_diseases(
    settings: &DatasetSettings,
    output: &Path,
    report: &mut OrganizeReport,
) -> Result<()> {
    let common_dir = Path::new(&settings.common_dir);
    if !common_dir.is_dir() {
        warn!("追加疾患フォルダが見つかりません。スキップします: {}", common_dir.display());
        return Ok(());
    }

    let mut diseases = Vec::new();
    for entry in std::fs::read_dir(common_dir)? {
        let path = entry?.path();
        if path.is_dir() {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                diseases.push(name.to_string());
            }
        }
    }
    diseases.sort();

    if diseases.is_empty() {
        warn!("追加疾患フォルダが空です: {}", common_dir.display());
        return Ok(());
    }
    info!("追加疾患クラス: {}", diseases.join(", "));

    let mut jobs = Vec::new();
    for disease in &diseases {
        let mut images = Vec::new();
        for entry in std::fs::read_dir(common_dir.join(disease))? {
            let path = entry?.path();
            let is_image = path.is_file()
                && path
                    .extension()
                    .map(|ext| {
                        let ext = ext.to_string_lossy().to_lowercase();
                        COMMON_EXTENSIONS.contains(&ext.as_str())
                    })
                    .unwrap_or(false);
            if is_image {
                images.push(path);
            }
        }
        images.sort();

        // クラス内のみで分割するので key は一定
        let (train, val) = stratified_split(images, |_| (), settings.val_ratio, settings.seed);
        for (split, paths) in [(Split::Train, train), (Split::Val, val)] {
            for src in paths {
                let file_name = match src.file_name().and_then(|n| n.to_str()) {
                    Some(name) => name.to_string(),
                    None => continue,
                };
                jobs.push(CopyJob {
                    src,
                    split,
                    label: disease.clone(),
                    file_name,
                });
            }
        }
    }

    copy_files(jobs, output, "common", report)?;
    report.common_classes = diseases;
    Ok(())
}

fn copy_files(jobs: Vec<CopyJob>, output: &Path, desc: &str, report: &mut OrganizeReport) -> Result<()> {
    let progress = ProgressBar::new(jobs.len() as u64);
    progress.set_style(
        ProgressStyle::with_template("{msg} [{bar:40}] {pos}/{len}")?.progress_chars("=> "),
    );
    progress.set_message(desc.to_string());

    for job in jobs {
        let dest_dir = output.join(job.split.dir_name()).join(&job.label);
        std::fs::create_dir_all(&dest_dir)
            .with_context(|| format!("Failed to create {}", dest_dir.display()))?;
        let dest = dest_dir.join(&job.file_name);
        std::fs::copy(&job.src, &dest).with_context(|| {
            format!("Failed to copy {} -> {}", job.src.display(), dest.display())
        })?;
        report.record(job.split, &job.label);
        progress.inc(1);
    }

    progress.finish_and_clear();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"jpeg bytes").unwrap();
    }

    fn settings_for(root: &Path) -> DatasetSettings {
        DatasetSettings {
            ham_dir: root.join("ham").to_string_lossy().to_string(),
            common_dir: root.join("common").to_string_lossy().to_string(),
            output_dir: root.join("out").to_string_lossy().to_string(),
            ..DatasetSettings::default()
        }
    }

    fn write_ham(root: &Path) {
        let mut csv = String::from("lesion_id,image_id,dx,dx_type,age,sex,localization\n");
        for i in 0..10 {
            csv.push_str(&format!("L{i},ISIC_{i:03},nv,histo,45,male,back\n"));
        }
        for i in 10..15 {
            csv.push_str(&format!("L{i},ISIC_{i:03},mel,histo,60,female,face\n"));
        }
        csv.push_str("L99,ISIC_999,df,histo,,,\n");
        std::fs::create_dir_all(root.join("ham")).unwrap();
        std::fs::write(root.join("ham/HAM10000_metadata.csv"), csv).unwrap();

        // Part 1 / Part 2 のようにサブフォルダに分かれていてもよい
        for i in 0..8 {
            touch(&root.join(format!("ham/part_1/ISIC_{i:03}.jpg")));
        }
        for i in 8..15 {
            touch(&root.join(format!("ham/part_2/ISIC_{i:03}.jpg")));
        }
        // ISIC_999 は画像なし
    }

    #[test]
    fn test_organize_ham10000() {
        let root = TempDir::new().unwrap();
        write_ham(root.path());
        let settings = settings_for(root.path());

        let report = organize(&settings).unwrap();
        assert!(report.ham_processed);
        assert_eq!(report.missing_images, 1);
        assert_eq!(report.train["Melanocytic_Nevi"], 8);
        assert_eq!(report.val["Melanocytic_Nevi"], 2);
        assert_eq!(report.train["Melanoma"], 4);
        assert_eq!(report.val["Melanoma"], 1);
        assert_eq!(report.total(Split::Train) + report.total(Split::Val), 15);

        let out = root.path().join("out");
        let nv_train = std::fs::read_dir(out.join("train/Melanocytic_Nevi")).unwrap().count();
        assert_eq!(nv_train, 8);
        assert!(out.join("val").is_dir());
    }

    #[test]
    fn test_organize_common_diseases() {
        let root = TempDir::new().unwrap();
        for i in 0..5 {
            touch(&root.path().join(format!("common/Acne/img{i}.JPG")));
        }
        touch(&root.path().join("common/Acne/readme.txt"));
        std::fs::create_dir_all(root.path().join("common/Empty")).unwrap();
        let settings = settings_for(root.path());

        let report = organize(&settings).unwrap();
        assert!(!report.ham_processed);
        assert_eq!(report.common_classes, vec!["Acne", "Empty"]);
        assert_eq!(report.train["Acne"], 4);
        assert_eq!(report.val["Acne"], 1);

        let val_files: Vec<String> = std::fs::read_dir(root.path().join("out/val/Acne"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(val_files.len(), 1);
        assert!(val_files[0].starts_with("img"));
    }

    #[test]
    fn test_clean_output_removes_stale_files() {
        let root = TempDir::new().unwrap();
        let stale = root.path().join("out/train/Old/stale.jpg");
        touch(&stale);

        organize(&settings_for(root.path())).unwrap();
        assert!(!stale.exists());

        touch(&stale);
        let settings = DatasetSettings {
            clean_output: false,
            ..settings_for(root.path())
        };
        organize(&settings).unwrap();
        assert!(stale.exists());
    }

    #[test]
    fn test_missing_inputs_are_skipped() {
        let root = TempDir::new().unwrap();
        let report = organize(&settings_for(root.path())).unwrap();
        assert_eq!(report, OrganizeReport::default());
        assert!(root.path().join("out/train").is_dir());
    }
}
