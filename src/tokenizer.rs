// SelfiesTokenizer: closed SELFIES alphabet + reserved ids, fixed-length encoding.
// Padding helpers shared by the step decoder, the planner adapter and training.

use std::collections::HashMap;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ZeroError;

// ---------------------------------------------------------------------------
// Special tokens
// ---------------------------------------------------------------------------

pub const PAD_TOKEN: &str = "<pad>";
pub const SOS_TOKEN: &str = "<s>";
pub const EOS_TOKEN: &str = "</s>";
pub const UNK_TOKEN: &str = "<unk>";
pub const REMOVE_TOKEN: &str = "<REMOVE>";
pub const END_TOKEN: &str = "<END>";

pub const DEFAULT_MAX_LEN: usize = 128;
pub const VOCAB_MANIFEST_VERSION: u32 = 1;

/// Default semantic constraints: atom -> bonding capacity.
const SEMANTIC_CONSTRAINTS: &[(&str, u32)] = &[
    ("H", 1),
    ("F", 1),
    ("Cl", 1),
    ("Br", 1),
    ("I", 1),
    ("B", 3),
    ("B+1", 2),
    ("B-1", 4),
    ("O", 2),
    ("O+1", 3),
    ("O-1", 1),
    ("N", 3),
    ("N+1", 4),
    ("N-1", 2),
    ("C", 4),
    ("C+1", 5),
    ("C-1", 3),
    ("P", 5),
    ("P+1", 6),
    ("P-1", 4),
    ("S", 6),
    ("S+1", 7),
    ("S-1", 5),
];

const BONDS: &[(&str, u32)] = &[("", 1), ("=", 2), ("#", 3)];

/// Sorted robust alphabet: every atom with every bond order its capacity
/// admits, plus ring and branch symbols.
pub fn robust_alphabet() -> Vec<String> {
    let mut alphabet = Vec::new();
    for &(atom, capacity) in SEMANTIC_CONSTRAINTS {
        for &(bond, order) in BONDS {
            if order <= capacity {
                alphabet.push(format!("[{bond}{atom}]"));
            }
        }
    }
    for i in 1..=3 {
        alphabet.push(format!("[Ring{i}]"));
        alphabet.push(format!("[=Ring{i}]"));
        alphabet.push(format!("[Branch{i}]"));
        alphabet.push(format!("[=Branch{i}]"));
        alphabet.push(format!("[#Branch{i}]"));
    }
    alphabet.sort();
    alphabet.dedup();
    alphabet
}

/// Split a SELFIES string into bracketed symbols. `.` is its own unit.
pub fn split_selfies(s: &str) -> Result<Vec<&str>> {
    let bytes = s.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'.' => {
                out.push(".");
                i += 1;
            }
            b'[' => {
                let close = s[i + 1..].find(']').ok_or_else(|| ZeroError::MalformedSelfies {
                    at: i,
                    reason: "hanging '[' bracket".into(),
                })?;
                let end = i + 1 + close + 1;
                out.push(&s[i..end]);
                i = end;
            }
            _ => {
                return Err(ZeroError::MalformedSelfies {
                    at: i,
                    reason: format!("unexpected character outside brackets in {s:?}"),
                }
                .into())
            }
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct SelfiesTokenizer {
    pub vocab: Vec<String>,
    tok2id: HashMap<String, u32>,
    max_len: usize,
    pad_id: u32,
    sos_id: u32,
    eos_id: u32,
    unk_id: u32,
    remove_id: u32,
    end_id: u32,
}

impl SelfiesTokenizer {
    pub fn new(max_len: usize) -> Self {
        let mut vocab = robust_alphabet();
        vocab.push(UNK_TOKEN.into());
        // Structural block is pad/sos/eos/unk; unk already sits right after the alphabet.
        for t in [PAD_TOKEN, SOS_TOKEN, EOS_TOKEN] {
            vocab.push(t.into());
        }
        for t in [REMOVE_TOKEN, END_TOKEN] {
            vocab.push(t.into());
        }

        let mut tok2id = HashMap::with_capacity(vocab.len());
        for (i, tok) in vocab.iter().enumerate() {
            tok2id.insert(tok.clone(), i as u32);
        }
        let lookup = |t: &str| tok2id[t];

        Self {
            pad_id: lookup(PAD_TOKEN),
            sos_id: lookup(SOS_TOKEN),
            eos_id: lookup(EOS_TOKEN),
            unk_id: lookup(UNK_TOKEN),
            remove_id: lookup(REMOVE_TOKEN),
            end_id: lookup(END_TOKEN),
            vocab,
            tok2id,
            max_len,
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn id(&self, tok: &str) -> u32 {
        self.tok2id.get(tok).copied().unwrap_or(self.unk_id)
    }

    pub fn token(&self, id: u32) -> &str {
        self.vocab
            .get(id as usize)
            .map(|s| s.as_str())
            .unwrap_or(UNK_TOKEN)
    }

    pub fn pad_id(&self) -> u32 {
        self.pad_id
    }
    pub fn sos_id(&self) -> u32 {
        self.sos_id
    }
    pub fn eos_id(&self) -> u32 {
        self.eos_id
    }
    pub fn unk_id(&self) -> u32 {
        self.unk_id
    }
    pub fn remove_id(&self) -> u32 {
        self.remove_id
    }
    pub fn end_id(&self) -> u32 {
        self.end_id
    }

    /// pad/sos/eos/unk. Control tokens are not special: they survive decoding.
    pub fn is_special(&self, id: u32) -> bool {
        id == self.pad_id || id == self.sos_id || id == self.eos_id || id == self.unk_id
    }

    /// `[sos, units..., eos]` without padding. Fails if it would not fit in `max_len`.
    pub fn encode_unpadded(&self, selfies: &str) -> Result<Vec<u32>> {
        let units = split_selfies(selfies)?;
        let len = units.len() + 2;
        if len > self.max_len {
            return Err(ZeroError::LengthExceeded { len, max_len: self.max_len }.into());
        }
        let mut ids = Vec::with_capacity(len);
        ids.push(self.sos_id);
        ids.extend(units.iter().map(|u| self.id(u)));
        ids.push(self.eos_id);
        Ok(ids)
    }

    /// Encode to exactly `max_len` ids, right-padded with `<pad>`.
    pub fn encode(&self, selfies: &str) -> Result<Vec<u32>> {
        let ids = self.encode_unpadded(selfies)?;
        Ok(pad_to_max_len(&ids, self.max_len, self.pad_id)?.ids)
    }

    /// Decode ids back to SELFIES, skipping special tokens. Ids outside the
    /// vocabulary read as `<unk>` and are skipped with it.
    pub fn decode(&self, ids: &[u32]) -> String {
        ids.iter()
            .filter(|&&id| (id as usize) < self.vocab.len() && !self.is_special(id))
            .map(|&id| self.token(id))
            .collect()
    }

    // ----- Persistence -----

    pub fn checksum(&self) -> String {
        vocab_checksum(&self.vocab)
    }

    pub fn manifest(&self) -> VocabManifest {
        VocabManifest {
            version: VOCAB_MANIFEST_VERSION,
            max_len: self.max_len,
            tokens: self.vocab.clone(),
            checksum: self.checksum(),
        }
    }

    /// Rebuild from a persisted manifest. The stored vocabulary must be
    /// intact and identical to the one this build produces.
    pub fn from_manifest(manifest: &VocabManifest) -> Result<Self> {
        let stored = vocab_checksum(&manifest.tokens);
        if stored != manifest.checksum {
            return Err(ZeroError::VocabMismatch {
                expected: manifest.checksum.clone(),
                found: stored,
            }
            .into());
        }
        let tok = Self::new(manifest.max_len);
        let ours = tok.checksum();
        if ours != manifest.checksum {
            return Err(ZeroError::VocabMismatch {
                expected: manifest.checksum.clone(),
                found: ours,
            }
            .into());
        }
        Ok(tok)
    }
}

impl Default for SelfiesTokenizer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LEN)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VocabManifest {
    pub version: u32,
    pub max_len: usize,
    pub tokens: Vec<String>,
    pub checksum: String,
}

fn vocab_checksum(tokens: &[String]) -> String {
    let mut hasher = Sha256::new();
    for t in tokens {
        hasher.update(t.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

// ---------------------------------------------------------------------------
// Padding
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct PaddedSequence {
    pub ids: Vec<u32>,
    /// 1 for real positions, 0 for padding.
    pub mask: Vec<u8>,
}

impl PaddedSequence {
    pub fn len(&self) -> usize {
        self.mask.iter().filter(|&&m| m != 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(ids [1,T] u32, mask [1,T] u8)`.
    pub fn to_tensors(&self, device: &Device) -> Result<(Tensor, Tensor)> {
        let t = self.ids.len();
        let ids = Tensor::from_vec(self.ids.clone(), (1, t), device)?;
        let mask = Tensor::from_vec(self.mask.clone(), (1, t), device)?;
        Ok((ids, mask))
    }
}

/// Right-pad `ids` to `max_len`. Never truncates.
pub fn pad_to_max_len(ids: &[u32], max_len: usize, pad_id: u32) -> Result<PaddedSequence> {
    if ids.len() > max_len {
        return Err(ZeroError::LengthExceeded { len: ids.len(), max_len }.into());
    }
    let mut padded = ids.to_vec();
    padded.resize(max_len, pad_id);
    let mut mask = vec![1u8; ids.len()];
    mask.resize(max_len, 0);
    Ok(PaddedSequence { ids: padded, mask })
}

/// Pad a batch of variable-length rows into `(ids [B,T], mask [B,T])`.
pub fn pad_batch(
    rows: &[Vec<u32>],
    max_len: usize,
    pad_id: u32,
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    let mut ids = Vec::with_capacity(rows.len() * max_len);
    let mut mask = Vec::with_capacity(rows.len() * max_len);
    for row in rows {
        let p = pad_to_max_len(row, max_len, pad_id)?;
        ids.extend(p.ids);
        mask.extend(p.mask);
    }
    let b = rows.len();
    Ok((
        Tensor::from_vec(ids, (b, max_len), device)?,
        Tensor::from_vec(mask, (b, max_len), device)?,
    ))
}

/// Tensor form of [`pad_to_max_len`] for a rectangular `[B,L]` u32 prefix.
pub fn pad_prefix_tensor(prefix: &Tensor, max_len: usize, pad_id: u32) -> Result<(Tensor, Tensor)> {
    let (b, l) = prefix.dims2()?;
    if l > max_len {
        return Err(ZeroError::LengthExceeded { len: l, max_len }.into());
    }
    let device = prefix.device();
    let pad_len = max_len - l;
    let prefix = prefix.to_dtype(DType::U32)?;
    let ids = if pad_len == 0 {
        prefix
    } else {
        let pad = Tensor::full(pad_id, (b, pad_len), device)?;
        Tensor::cat(&[&prefix, &pad], 1)?
    };
    let valid = Tensor::ones((b, l), DType::U8, device)?;
    let mask = if pad_len == 0 {
        valid
    } else {
        Tensor::cat(&[&valid, &Tensor::zeros((b, pad_len), DType::U8, device)?], 1)?
    };
    Ok((ids, mask))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::is_length_exceeded;

    #[test]
    fn test_vocab_layout() {
        let tok = SelfiesTokenizer::new(8);
        let n = robust_alphabet().len() as u32;
        assert_eq!(n, 69);
        assert_eq!(tok.vocab_size(), 69 + 6);
        assert_eq!(tok.unk_id(), n);
        assert_eq!(tok.pad_id(), n + 1);
        assert_eq!(tok.sos_id(), n + 2);
        assert_eq!(tok.eos_id(), n + 3);
        assert_eq!(tok.remove_id(), n + 4);
        assert_eq!(tok.end_id(), n + 5);
    }

    #[test]
    fn test_alphabet_sorted_and_unique() {
        let alphabet = robust_alphabet();
        let mut sorted = alphabet.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(alphabet, sorted);
        assert!(alphabet.contains(&"[C]".to_string()));
        assert!(alphabet.contains(&"[#C]".to_string()));
        assert!(alphabet.contains(&"[=Branch2]".to_string()));
        assert!(!alphabet.contains(&"[=F]".to_string()), "F cannot take a double bond");
    }

    #[test]
    fn test_all_tokens_roundtrip() {
        let tok = SelfiesTokenizer::default();
        for (i, t) in tok.vocab.iter().enumerate() {
            assert_eq!(tok.id(t), i as u32, "token {t} has wrong id");
            assert_eq!(tok.token(i as u32), t);
        }
    }

    #[test]
    fn test_ids_deterministic() {
        let a = SelfiesTokenizer::new(16);
        let b = SelfiesTokenizer::new(64);
        assert_eq!(a.vocab, b.vocab);
        assert_eq!(a.checksum(), b.checksum());
    }

    #[test]
    fn test_split_selfies() -> Result<()> {
        assert_eq!(split_selfies("[C][=O]")?, vec!["[C]", "[=O]"]);
        assert_eq!(split_selfies("[C].[O]")?, vec!["[C]", ".", "[O]"]);
        assert!(split_selfies("").unwrap_or_default().is_empty());
        Ok(())
    }

    #[test]
    fn test_split_selfies_malformed() {
        let err = split_selfies("[C][O").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ZeroError>(),
            Some(ZeroError::MalformedSelfies { at: 3, .. })
        ));
        assert!(split_selfies("C[O]").is_err());
    }

    #[test]
    fn test_encode_two_units_max_len_8() -> Result<()> {
        let tok = SelfiesTokenizer::new(8);
        let ids = tok.encode("[C][O]")?;
        let (s, e, p) = (tok.sos_id(), tok.eos_id(), tok.pad_id());
        assert_eq!(ids, vec![s, tok.id("[C]"), tok.id("[O]"), e, p, p, p, p]);

        let padded = pad_to_max_len(&tok.encode_unpadded("[C][O]")?, 8, p)?;
        assert_eq!(padded.ids, ids);
        assert_eq!(padded.mask, vec![1, 1, 1, 1, 0, 0, 0, 0]);
        Ok(())
    }

    #[test]
    fn test_unknown_symbol_maps_to_unk() -> Result<()> {
        let tok = SelfiesTokenizer::new(8);
        let ids = tok.encode_unpadded("[C][Xx]")?;
        assert_eq!(ids[2], tok.unk_id());
        Ok(())
    }

    #[test]
    fn test_decode_roundtrip() -> Result<()> {
        let tok = SelfiesTokenizer::new(32);
        for s in ["[C][=C][C][=C][C][=C][Ring1][=Branch1]", "[N][C][Branch1][C][O][C]", ""] {
            assert_eq!(tok.decode(&tok.encode(s)?), s);
        }
        Ok(())
    }

    #[test]
    fn test_decode_keeps_control_tokens() {
        let tok = SelfiesTokenizer::new(8);
        let ids = [tok.sos_id(), tok.id("[C]"), tok.end_id(), tok.pad_id()];
        assert_eq!(tok.decode(&ids), "[C]<END>");
    }

    #[test]
    fn test_decode_skips_out_of_range_ids() {
        let tok = SelfiesTokenizer::new(8);
        let past_end = tok.vocab_size() as u32;
        assert_eq!(tok.decode(&[tok.unk_id()]), "");
        assert_eq!(tok.decode(&[past_end, 999]), "");
        assert_eq!(tok.decode(&[tok.id("[C]"), 999, tok.id("[O]")]), "[C][O]");
    }

    #[test]
    fn test_encode_fails_instead_of_truncating() -> Result<()> {
        let tok = SelfiesTokenizer::new(8);
        // 6 units + 2 markers fits exactly.
        assert_eq!(tok.encode("[C][C][C][C][C][C]")?.len(), 8);
        // 7 units + 2 markers does not.
        let err = tok.encode("[C][C][C][C][C][C][C]").unwrap_err();
        assert!(is_length_exceeded(&err));
        Ok(())
    }

    #[test]
    fn test_pad_to_max_len() -> Result<()> {
        for len in 0..=8usize {
            let ids: Vec<u32> = (0..len as u32).map(|i| i + 10).collect();
            let p = pad_to_max_len(&ids, 8, 0)?;
            assert_eq!(p.ids.len(), 8);
            assert_eq!(&p.ids[..len], &ids[..]);
            assert!(p.ids[len..].iter().all(|&x| x == 0));
            assert!(p.mask[..len].iter().all(|&m| m == 1));
            assert!(p.mask[len..].iter().all(|&m| m == 0));
            assert_eq!(p.len(), len);
        }
        Ok(())
    }

    #[test]
    fn test_pad_length_exceeded() {
        let ids = vec![1u32; 9];
        let err = pad_to_max_len(&ids, 8, 0).unwrap_err();
        assert_eq!(
            err.downcast_ref::<ZeroError>(),
            Some(&ZeroError::LengthExceeded { len: 9, max_len: 8 })
        );
    }

    #[test]
    fn test_pad_batch_shapes() -> Result<()> {
        let device = Device::Cpu;
        let rows = vec![vec![1u32, 2], vec![3u32, 4, 5]];
        let (ids, mask) = pad_batch(&rows, 4, 0, &device)?;
        assert_eq!(ids.to_vec2::<u32>()?, vec![vec![1, 2, 0, 0], vec![3, 4, 5, 0]]);
        assert_eq!(mask.to_vec2::<u8>()?, vec![vec![1, 1, 0, 0], vec![1, 1, 1, 0]]);
        Ok(())
    }

    #[test]
    fn test_pad_prefix_tensor() -> Result<()> {
        let device = Device::Cpu;
        let prefix = Tensor::new(&[[7u32, 8], [9, 10]], &device)?;
        let (ids, mask) = pad_prefix_tensor(&prefix, 4, 1)?;
        assert_eq!(ids.to_vec2::<u32>()?, vec![vec![7, 8, 1, 1], vec![9, 10, 1, 1]]);
        assert_eq!(mask.to_vec2::<u8>()?, vec![vec![1, 1, 0, 0], vec![1, 1, 0, 0]]);

        let full = Tensor::new(&[[1u32, 2, 3, 4, 5]], &device)?;
        assert!(is_length_exceeded(&pad_prefix_tensor(&full, 4, 0).unwrap_err()));
        Ok(())
    }

    #[test]
    fn test_manifest_roundtrip() -> Result<()> {
        let tok = SelfiesTokenizer::new(32);
        let json = serde_json::to_string(&tok.manifest())?;
        let manifest: VocabManifest = serde_json::from_str(&json)?;
        let restored = SelfiesTokenizer::from_manifest(&manifest)?;
        assert_eq!(restored.vocab, tok.vocab);
        assert_eq!(restored.max_len(), 32);
        Ok(())
    }

    #[test]
    fn test_manifest_mismatch() {
        let tok = SelfiesTokenizer::new(32);
        let mut manifest = tok.manifest();
        manifest.tokens.swap(0, 1);
        assert!(matches!(
            SelfiesTokenizer::from_manifest(&manifest).unwrap_err().downcast_ref::<ZeroError>(),
            Some(ZeroError::VocabMismatch { .. })
        ));

        // Consistent but foreign vocabulary.
        manifest.checksum = vocab_checksum(&manifest.tokens);
        assert!(SelfiesTokenizer::from_manifest(&manifest).is_err());
    }
}
