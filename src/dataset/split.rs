//! 層化分割
//!
//! クラスごとにシード付きでシャッフルし、`ceil(n * val_ratio)` 件を検証用に回します。
//! 1件しかないクラスは学習用に残し、各クラス最低1件は必ず学習用に残ります。

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// クラス内の件数から検証用の件数を決める
fn val_count(n: usize, val_ratio: f32) -> usize {
    if n <= 1 {
        return 0;
    }
    let ratio = val_ratio.clamp(0.0, 1.0) as f64;
    // f32 -> f64 の丸め誤差（0.2 -> 0.2000000029..）で整数ちょうどが繰り上がらないようにする
    let count = (n as f64 * ratio - 1e-6).ceil().max(0.0) as usize;
    count.min(n - 1)
}

/// `key` で層化して (学習用, 検証用) に分割
///
/// 同じ入力・同じシードなら常に同じ結果になります。
pub fn stratified_split<T, K, F>(items: Vec<T>, key: F, val_ratio: f32, seed: u64) -> (Vec<T>, Vec<T>)
where
    K: Ord,
    F: Fn(&T) -> K,
{
    let mut groups: BTreeMap<K, Vec<T>> = BTreeMap::new();
    for item in items {
        groups.entry(key(&item)).or_default().push(item);
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut train = Vec::new();
    let mut val = Vec::new();

    for (_, mut group) in groups {
        group.shuffle(&mut rng);
        let n_val = val_count(group.len(), val_ratio);
        let rest = group.split_off(n_val);
        val.extend(group);
        train.extend(rest);
    }

    (train, val)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labelled(counts: &[(&'static str, usize)]) -> Vec<(&'static str, usize)> {
        counts
            .iter()
            .flat_map(|(label, n)| (0..*n).map(move |i| (*label, i)))
            .collect()
    }

    fn count(items: &[(&str, usize)], label: &str) -> usize {
        items.iter().filter(|(l, _)| *l == label).count()
    }

    #[test]
    fn test_val_count_rules() {
        assert_eq!(val_count(0, 0.2), 0);
        assert_eq!(val_count(1, 0.2), 0);
        assert_eq!(val_count(2, 0.2), 1);
        assert_eq!(val_count(10, 0.2), 2);
        assert_eq!(val_count(11, 0.2), 3);
        assert_eq!(val_count(5, 0.2), 1);
        assert_eq!(val_count(100, 0.2), 20);
        assert_eq!(val_count(4, 0.25), 1);
        assert_eq!(val_count(5, 1.0), 4);
        assert_eq!(val_count(5, 0.0), 0);
    }

    #[test]
    fn test_split_is_stratified() {
        let items = labelled(&[("nv", 50), ("mel", 10), ("df", 1)]);
        let (train, val) = stratified_split(items, |(l, _)| *l, 0.2, 42);

        assert_eq!(train.len() + val.len(), 61);
        assert_eq!(count(&val, "nv"), 10);
        assert_eq!(count(&val, "mel"), 2);
        assert_eq!(count(&val, "df"), 0);
        for label in ["nv", "mel", "df"] {
            assert!(count(&train, label) >= 1, "{} missing from train", label);
        }
    }

    #[test]
    fn test_split_is_deterministic() {
        let items = labelled(&[("a", 20), ("b", 7)]);
        let first = stratified_split(items.clone(), |(l, _)| *l, 0.2, 42);
        let second = stratified_split(items.clone(), |(l, _)| *l, 0.2, 42);
        assert_eq!(first, second);

        let other = stratified_split(items, |(l, _)| *l, 0.2, 7);
        assert_ne!(first, other);
    }

    #[test]
    fn test_no_item_lost_or_duplicated() {
        let items = labelled(&[("a", 13), ("b", 4)]);
        let (mut train, val) = stratified_split(items.clone(), |(l, _)| *l, 0.25, 1);
        train.extend(val);
        train.sort();
        let mut expected = items;
        expected.sort();
        assert_eq!(train, expected);
    }
}
