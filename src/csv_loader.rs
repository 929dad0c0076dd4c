use crate::types::LesionRecord;
use anyhow::{Context, Result};
use csv::ReaderBuilder;
use std::path::Path;

/// HAM10000_metadata.csv を読み込む
///
/// `image_id` と `dx` 以外の列は存在すれば読み込み、無ければ空のままにします。
pub fn load_metadata_csv(path: &Path) -> Result<Vec<LesionRecord>> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("Failed to open metadata CSV: {}", path.display()))?;

    let headers = reader.headers()?.clone();
    for required in ["image_id", "dx"] {
        if !headers.iter().any(|h| h == required) {
            anyhow::bail!("Missing column '{}' in {}", required, path.display());
        }
    }

    let mut records = Vec::new();
    for (line, result) in reader.deserialize::<LesionRecord>().enumerate() {
        // ヘッダー行の分だけずらして表示
        let record = result.with_context(|| format!("Invalid row at line {}", line + 2))?;
        records.push(record);
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_full_ham_header() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "lesion_id,image_id,dx,dx_type,age,sex,localization").unwrap();
        writeln!(file, "HAM_0000118,ISIC_0027419,bkl,histo,80.0,male,scalp").unwrap();
        writeln!(file, "HAM_0002730,ISIC_0026769,mel,histo,,female,ear").unwrap();

        let records = load_metadata_csv(file.path()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].image_id, "ISIC_0027419");
        assert_eq!(records[0].dx, "bkl");
        assert_eq!(records[0].age, Some(80.0));
        assert_eq!(records[1].age, None);
        assert_eq!(records[1].localization.as_deref(), Some("ear"));
    }

    #[test]
    fn test_load_minimal_columns() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "image_id,dx").unwrap();
        writeln!(file, "ISIC_1,nv").unwrap();

        let records = load_metadata_csv(file.path()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].lesion_id, None);
    }

    #[test]
    fn test_missing_dx_column() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "image_id,diagnosis").unwrap();
        writeln!(file, "ISIC_1,nv").unwrap();

        let err = load_metadata_csv(file.path()).unwrap_err();
        assert!(err.to_string().contains("dx"));
    }
}
