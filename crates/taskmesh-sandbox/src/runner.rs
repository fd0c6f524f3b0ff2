//! Per-kind task computation.
//!
//! Every runner is a pure function from payload to JSON output. Outputs are
//! built only from sorted or order-stable data so two peers running the
//! same payload always canonicalize to the same bytes.

use std::collections::BTreeMap;

use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use taskmesh_protocol::task::TaskPayload;

use crate::executor::ExecutionError;

/// Caps applied during payload validation, before any work starts.
const MAX_LIST_LEN: usize = 1_000_000;
const MAX_TEXT_BYTES: usize = 4 * 1024 * 1024;
const MAX_FACTORIAL_N: u64 = 34; // largest n with n! representable in u128
const MAX_MATRIX_DIM: usize = 256;

/// Reject payloads that would blow the execution budget before running them.
pub fn validate(payload: &TaskPayload, max_memory_bytes: u64) -> Result<(), ExecutionError> {
    let estimated = estimated_memory(payload)?;
    if estimated > max_memory_bytes {
        return Err(ExecutionError::ResourceExceeded(format!(
            "estimated working set {estimated} bytes exceeds limit {max_memory_bytes}"
        )));
    }
    Ok(())
}

fn estimated_memory(payload: &TaskPayload) -> Result<u64, ExecutionError> {
    match payload {
        TaskPayload::Sum { numbers }
        | TaskPayload::Multiply { numbers }
        | TaskPayload::Sort { numbers } => {
            if numbers.is_empty() {
                return Err(ExecutionError::InvalidPayload("empty number list".to_string()));
            }
            if numbers.len() > MAX_LIST_LEN {
                return Err(ExecutionError::InvalidPayload(format!(
                    "list of {} numbers exceeds maximum {MAX_LIST_LEN}",
                    numbers.len()
                )));
            }
            // Sort clones the input; budget double.
            Ok(numbers.len() as u64 * 16)
        }
        TaskPayload::Hash { text } | TaskPayload::TextAnalysis { text } => {
            if text.len() > MAX_TEXT_BYTES {
                return Err(ExecutionError::InvalidPayload(format!(
                    "text of {} bytes exceeds maximum {MAX_TEXT_BYTES}",
                    text.len()
                )));
            }
            Ok(text.len() as u64 * 2)
        }
        TaskPayload::Factorial { n } => {
            if *n > MAX_FACTORIAL_N {
                return Err(ExecutionError::InvalidPayload(format!(
                    "factorial input {n} exceeds maximum {MAX_FACTORIAL_N}"
                )));
            }
            Ok(64)
        }
        TaskPayload::PrimeCheck { .. } => Ok(64),
        TaskPayload::MatrixMultiply { a, b } => {
            let (rows, inner) = matrix_dims(a)?;
            let (b_rows, cols) = matrix_dims(b)?;
            if inner != b_rows {
                return Err(ExecutionError::InvalidPayload(format!(
                    "matrix dimensions {rows}x{inner} and {b_rows}x{cols} are incompatible"
                )));
            }
            if rows > MAX_MATRIX_DIM || inner > MAX_MATRIX_DIM || cols > MAX_MATRIX_DIM {
                return Err(ExecutionError::InvalidPayload(format!(
                    "matrix dimension exceeds maximum {MAX_MATRIX_DIM}"
                )));
            }
            Ok(((rows * inner) + (inner * cols) + (rows * cols)) as u64 * 8)
        }
    }
}

fn matrix_dims(m: &[Vec<i64>]) -> Result<(usize, usize), ExecutionError> {
    if m.is_empty() || m[0].is_empty() {
        return Err(ExecutionError::InvalidPayload("empty matrix".to_string()));
    }
    let cols = m[0].len();
    if m.iter().any(|row| row.len() != cols) {
        return Err(ExecutionError::InvalidPayload("ragged matrix".to_string()));
    }
    Ok((m.len(), cols))
}

/// Run a validated payload to completion.
pub fn run(payload: &TaskPayload) -> Result<Value, ExecutionError> {
    match payload {
        TaskPayload::Sum { numbers } => {
            let mut total: i64 = 0;
            for n in numbers {
                total = total
                    .checked_add(*n)
                    .ok_or_else(|| ExecutionError::Crashed("integer overflow in sum".to_string()))?;
            }
            Ok(json!({ "sum": total }))
        }
        TaskPayload::Multiply { numbers } => {
            let mut product: i64 = 1;
            for n in numbers {
                product = product.checked_mul(*n).ok_or_else(|| {
                    ExecutionError::Crashed("integer overflow in product".to_string())
                })?;
            }
            Ok(json!({ "product": product }))
        }
        TaskPayload::Sort { numbers } => {
            let mut sorted = numbers.clone();
            sorted.sort_unstable();
            Ok(json!({ "sorted": sorted }))
        }
        TaskPayload::Hash { text } => {
            let digest = Sha256::digest(text.as_bytes());
            Ok(json!({ "sha256": hex::encode(digest) }))
        }
        TaskPayload::Factorial { n } => {
            let mut acc: u128 = 1;
            for i in 2..=*n as u128 {
                acc = acc.checked_mul(i).ok_or_else(|| {
                    ExecutionError::Crashed("integer overflow in factorial".to_string())
                })?;
            }
            // u128 does not survive JSON; emit as a decimal string.
            Ok(json!({ "factorial": acc.to_string() }))
        }
        TaskPayload::PrimeCheck { n } => Ok(json!({ "n": n, "is_prime": is_prime(*n) })),
        TaskPayload::MatrixMultiply { a, b } => {
            let product = matrix_multiply(a, b)?;
            Ok(json!({ "product": product }))
        }
        TaskPayload::TextAnalysis { text } => Ok(text_analysis(text)),
    }
}

fn is_prime(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    if n < 4 {
        return true;
    }
    if n % 2 == 0 || n % 3 == 0 {
        return false;
    }
    let mut i: u64 = 5;
    while i.saturating_mul(i) <= n {
        if n % i == 0 || n % (i + 2) == 0 {
            return false;
        }
        i += 6;
    }
    true
}

fn matrix_multiply(a: &[Vec<i64>], b: &[Vec<i64>]) -> Result<Vec<Vec<i64>>, ExecutionError> {
    let rows = a.len();
    let inner = a[0].len();
    let cols = b[0].len();

    let mut out = vec![vec![0i64; cols]; rows];
    for (i, row) in a.iter().enumerate() {
        for j in 0..cols {
            let mut acc: i128 = 0;
            for (k, &val) in row.iter().enumerate().take(inner) {
                acc += val as i128 * b[k][j] as i128;
            }
            out[i][j] = i64::try_from(acc).map_err(|_| {
                ExecutionError::Crashed("integer overflow in matrix product".to_string())
            })?;
        }
    }
    Ok(out)
}

fn text_analysis(text: &str) -> Value {
    // BTreeMap keeps word iteration in a stable order, so the most-common
    // tie-break (smallest word wins) is deterministic.
    let mut counts: BTreeMap<String, u64> = BTreeMap::new();
    let mut word_count: u64 = 0;
    for raw in text.split_whitespace() {
        let word: String = raw
            .chars()
            .filter(|c| c.is_alphanumeric())
            .collect::<String>()
            .to_lowercase();
        if word.is_empty() {
            continue;
        }
        word_count += 1;
        *counts.entry(word).or_insert(0) += 1;
    }

    let most_common = counts
        .iter()
        .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
        .map(|(word, count)| json!({ "word": word, "count": count }));

    json!({
        "char_count": text.chars().count() as u64,
        "line_count": text.lines().count() as u64,
        "word_count": word_count,
        "unique_words": counts.len() as u64,
        "most_common": most_common,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sum_and_multiply() {
        let out = run(&TaskPayload::Sum { numbers: vec![1, 2, 3, -1] }).unwrap();
        assert_eq!(out["sum"], 5);
        let out = run(&TaskPayload::Multiply { numbers: vec![2, 3, 4] }).unwrap();
        assert_eq!(out["product"], 24);
    }

    #[test]
    fn sum_overflow_is_crash_not_panic() {
        let out = run(&TaskPayload::Sum { numbers: vec![i64::MAX, 1] });
        assert!(matches!(out, Err(ExecutionError::Crashed(_))));
    }

    #[test]
    fn sort_is_deterministic() {
        let out = run(&TaskPayload::Sort { numbers: vec![3, 1, 2, 1] }).unwrap();
        assert_eq!(out["sorted"], json!([1, 1, 2, 3]));
    }

    #[test]
    fn hash_matches_known_digest() {
        let out = run(&TaskPayload::Hash { text: "abc".to_string() }).unwrap();
        assert_eq!(
            out["sha256"],
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn factorial_known_values() {
        let out = run(&TaskPayload::Factorial { n: 0 }).unwrap();
        assert_eq!(out["factorial"], "1");
        let out = run(&TaskPayload::Factorial { n: 10 }).unwrap();
        assert_eq!(out["factorial"], "3628800");
        let out = run(&TaskPayload::Factorial { n: 34 }).unwrap();
        assert_eq!(out["factorial"], "295232799039604140847618609643520000000");
    }

    #[test]
    fn prime_check_known_values() {
        for (n, expected) in [(0u64, false), (1, false), (2, true), (3, true), (4, false),
                              (97, true), (7919, true), (7920, false)] {
            let out = run(&TaskPayload::PrimeCheck { n }).unwrap();
            assert_eq!(out["is_prime"], expected, "n={n}");
        }
    }

    #[test]
    fn matrix_multiply_identity() {
        let a = vec![vec![1, 2], vec![3, 4]];
        let identity = vec![vec![1, 0], vec![0, 1]];
        let out = run(&TaskPayload::MatrixMultiply { a: a.clone(), b: identity }).unwrap();
        assert_eq!(out["product"], json!(a));
    }

    #[test]
    fn text_analysis_counts_and_tie_break() {
        let out = run(&TaskPayload::TextAnalysis {
            text: "apple banana apple banana cherry".to_string(),
        })
        .unwrap();
        assert_eq!(out["word_count"], 5);
        assert_eq!(out["unique_words"], 3);
        // apple and banana tie at 2; the lexicographically smaller wins.
        assert_eq!(out["most_common"]["word"], "apple");
        assert_eq!(out["most_common"]["count"], 2);
    }

    #[test]
    fn validate_rejects_empty_list() {
        let err = validate(&TaskPayload::Sum { numbers: vec![] }, u64::MAX).unwrap_err();
        assert!(matches!(err, ExecutionError::InvalidPayload(_)));
    }

    #[test]
    fn validate_rejects_oversized_factorial() {
        let err = validate(&TaskPayload::Factorial { n: 35 }, u64::MAX).unwrap_err();
        assert!(matches!(err, ExecutionError::InvalidPayload(_)));
    }

    #[test]
    fn validate_rejects_ragged_matrix() {
        let err = validate(
            &TaskPayload::MatrixMultiply {
                a: vec![vec![1, 2], vec![3]],
                b: vec![vec![1], vec![2]],
            },
            u64::MAX,
        )
        .unwrap_err();
        assert!(matches!(err, ExecutionError::InvalidPayload(_)));
    }

    #[test]
    fn validate_enforces_memory_budget() {
        let err = validate(&TaskPayload::Sort { numbers: vec![0; 1024] }, 100).unwrap_err();
        assert!(matches!(err, ExecutionError::ResourceExceeded(_)));
    }
}
