//! データセットの整理（train/val フォルダ構成への分割コピー）

pub mod organize;
pub mod split;

pub use organize::{organize, OrganizeReport};
pub use split::stratified_split;

/// HAM10000 の診断コード → クラスフォルダ名
pub const HAM_LABELS: [(&str, &str); 7] = [
    ("nv", "Melanocytic_Nevi"),
    ("mel", "Melanoma"),
    ("bkl", "Benign_Keratosis"),
    ("bcc", "Basal_Cell_Carcinoma"),
    ("akiec", "Actinic_Keratoses"),
    ("vasc", "Vascular_Lesions"),
    ("df", "Dermatofibroma"),
];

/// 診断コードをクラス名に変換（未知のコードはそのまま）
pub fn ham_label(code: &str) -> String {
    HAM_LABELS
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, label)| label.to_string())
        .unwrap_or_else(|| code.to_string())
}
