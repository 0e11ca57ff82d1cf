//! Packed per-step results for a whole batch.
//!
//! Tokens, validity flags and running lengths for every decode row share a
//! single 2-D `I64` buffer. One dense buffer moves off the accelerator in a
//! single transfer; three separate ones would not. Static half-open column
//! ranges say where each sub-region lives.
//!
//! Rows are grouped per slot: slot `s` owns rows
//! `[s * samples_per_slot, (s + 1) * samples_per_slot)`.

use std::thread::{self, JoinHandle};

use candle_core::{DType, Device, Tensor};

use crate::error::{EngineError, Result};

/// Half-open column range `[start, end)` inside a [`ResultTokens`] buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ColumnRange {
    pub start: usize,
    pub end: usize,
}

impl ColumnRange {
    pub const fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn overlaps(&self, other: &ColumnRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl From<(usize, usize)> for ColumnRange {
    fn from((start, end): (usize, usize)) -> Self {
        Self { start, end }
    }
}

/// Sliced view of one or more slots.
#[derive(Debug, Clone)]
pub struct SlotData {
    /// `[rows, token_width]`
    pub tokens: Tensor,
    /// `[rows, token_width]`, 1 where the token is real.
    pub valid: Tensor,
    /// `[rows]`, tokens generated so far per row.
    pub lengths: Tensor,
    /// `[rows, token_width]` when the producing call reported log probabilities.
    pub log_prob: Option<Tensor>,
}

/// Host-side values of a single row.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotSample {
    pub tokens: Vec<u32>,
    pub valid: Vec<bool>,
    pub length: usize,
    pub log_prob: Option<Vec<f32>>,
}

impl SlotSample {
    /// One-token row, the shape prefill and generate produce.
    pub fn single(token: u32, valid: bool, length: usize) -> Self {
        Self {
            tokens: vec![token],
            valid: vec![valid],
            length,
            log_prob: None,
        }
    }

    pub fn with_log_prob(mut self, log_prob: Vec<f32>) -> Self {
        self.log_prob = Some(log_prob);
        self
    }

    /// Tokens whose validity flag is set.
    pub fn valid_tokens(&self) -> impl Iterator<Item = u32> + '_ {
        self.tokens
            .iter()
            .zip(&self.valid)
            .filter_map(|(&t, &v)| v.then_some(t))
    }
}

impl SlotData {
    pub fn num_rows(&self) -> Result<usize> {
        Ok(self.lengths.dims1()?)
    }

    /// Materialize every row on the host.
    pub fn to_samples(&self) -> Result<Vec<SlotSample>> {
        let tokens = self.tokens.to_vec2::<i64>()?;
        let valid = self.valid.to_vec2::<i64>()?;
        let lengths = self.lengths.to_vec1::<i64>()?;
        let log_prob = match &self.log_prob {
            Some(lp) => Some(lp.to_dtype(DType::F32)?.to_vec2::<f32>()?),
            None => None,
        };
        let samples = tokens
            .into_iter()
            .zip(valid)
            .zip(lengths)
            .enumerate()
            .map(|(i, ((tokens, valid), length))| SlotSample {
                tokens: tokens.into_iter().map(|t| t as u32).collect(),
                valid: valid.into_iter().map(|v| v != 0).collect(),
                length: length.max(0) as usize,
                log_prob: log_prob.as_ref().map(|lp| lp[i].clone()),
            })
            .collect();
        Ok(samples)
    }
}

/// Handle for an in-flight copy of a result buffer to host memory.
pub enum HostTransfer {
    /// The buffer already lived on the host.
    Ready(Tensor),
    Pending(JoinHandle<candle_core::Result<Tensor>>),
}

impl HostTransfer {
    pub fn is_ready(&self) -> bool {
        match self {
            Self::Ready(_) => true,
            Self::Pending(handle) => handle.is_finished(),
        }
    }

    /// Block until the host copy exists.
    pub fn wait(self) -> Result<Tensor> {
        match self {
            Self::Ready(t) => Ok(t),
            Self::Pending(handle) => handle
                .join()
                .map_err(|_| EngineError::Executor("host transfer thread panicked".into()))?
                .map_err(EngineError::from),
        }
    }
}

/// Dense token/validity/length buffer for a full batch.
#[derive(Debug, Clone)]
pub struct ResultTokens {
    data: Tensor,
    tokens_idx: ColumnRange,
    valid_idx: ColumnRange,
    length_idx: ColumnRange,
    samples_per_slot: usize,
    log_prob: Option<Tensor>,
}

impl ResultTokens {
    /// Wrap an already packed `[rows, width]` buffer.
    pub fn new(
        data: Tensor,
        tokens_idx: impl Into<ColumnRange>,
        valid_idx: impl Into<ColumnRange>,
        length_idx: impl Into<ColumnRange>,
        samples_per_slot: usize,
    ) -> Result<Self> {
        let tokens_idx = tokens_idx.into();
        let valid_idx = valid_idx.into();
        let length_idx = length_idx.into();
        let (rows, width) = data
            .dims2()
            .map_err(|_| EngineError::InvalidLayout(format!("expected 2-D data, got {:?}", data.dims())))?;
        validate_layout(rows, width, tokens_idx, valid_idx, length_idx, samples_per_slot)?;
        Ok(Self {
            data,
            tokens_idx,
            valid_idx,
            length_idx,
            samples_per_slot,
            log_prob: None,
        })
    }

    /// Pack separate `[rows, t]` tokens, `[rows, t]` validity and `[rows]`
    /// lengths into the canonical layout `tokens | valid | length`.
    pub fn pack(
        tokens: &Tensor,
        valid: &Tensor,
        lengths: &Tensor,
        samples_per_slot: usize,
    ) -> Result<Self> {
        let (rows, width) = tokens.dims2()?;
        if valid.dims2()? != (rows, width) || lengths.dims1()? != rows {
            return Err(EngineError::InvalidLayout(format!(
                "cannot pack tokens {:?}, valid {:?}, lengths {:?}",
                tokens.dims(),
                valid.dims(),
                lengths.dims()
            )));
        }
        let data = Tensor::cat(
            &[
                tokens.to_dtype(DType::I64)?,
                valid.to_dtype(DType::I64)?,
                lengths.to_dtype(DType::I64)?.unsqueeze(1)?,
            ],
            1,
        )?;
        Self::new(
            data,
            (0, width),
            (width, 2 * width),
            (2 * width, 2 * width + 1),
            samples_per_slot,
        )
    }

    /// Build a buffer from host rows. Log probabilities are kept only if
    /// every row carries them.
    pub fn from_samples(
        samples: &[SlotSample],
        samples_per_slot: usize,
        device: &Device,
    ) -> Result<Self> {
        let width = samples.first().map_or(1, |s| s.tokens.len());
        let rows = samples.len();
        let mut packed = Vec::with_capacity(rows * (2 * width + 1));
        for s in samples {
            if s.tokens.len() != width || s.valid.len() != width {
                return Err(EngineError::InvalidLayout(format!(
                    "row widths differ: expected {width}, got {} tokens / {} flags",
                    s.tokens.len(),
                    s.valid.len()
                )));
            }
            packed.extend(s.tokens.iter().map(|&t| i64::from(t)));
            packed.extend(s.valid.iter().map(|&v| i64::from(v)));
            packed.push(s.length as i64);
        }
        let data = Tensor::from_vec(packed, (rows, 2 * width + 1), device)?;
        let result = Self::new(
            data,
            (0, width),
            (width, 2 * width),
            (2 * width, 2 * width + 1),
            samples_per_slot,
        )?;

        let with_lp = samples.iter().filter(|s| s.log_prob.is_some()).count();
        if with_lp == 0 {
            return Ok(result);
        }
        if with_lp != rows {
            return Err(EngineError::LogProbMismatch);
        }
        let mut lp = Vec::with_capacity(rows * width);
        for s in samples {
            let row = s.log_prob.as_deref().unwrap_or_default();
            if row.len() != width {
                return Err(EngineError::InvalidLayout(format!(
                    "log_prob row has {} entries, expected {width}",
                    row.len()
                )));
            }
            lp.extend_from_slice(row);
        }
        result.with_log_prob(Tensor::from_vec(lp, (rows, width), device)?)
    }

    /// Stitch per-microbatch buffers into one logical batch, in order.
    pub fn concat_microbatches(parts: &[ResultTokens]) -> Result<Self> {
        let first = parts
            .first()
            .ok_or_else(|| EngineError::InvalidLayout("no microbatches to concatenate".into()))?;
        for part in &parts[1..] {
            if part.tokens_idx != first.tokens_idx
                || part.valid_idx != first.valid_idx
                || part.length_idx != first.length_idx
                || part.samples_per_slot != first.samples_per_slot
            {
                return Err(EngineError::InvalidLayout(
                    "microbatches disagree on layout".into(),
                ));
            }
        }
        let data: Vec<&Tensor> = parts.iter().map(|p| &p.data).collect();
        let result = Self::new(
            Tensor::cat(&data, 0)?,
            first.tokens_idx,
            first.valid_idx,
            first.length_idx,
            first.samples_per_slot,
        )?;

        let log_probs: Vec<&Tensor> = parts.iter().filter_map(|p| p.log_prob.as_ref()).collect();
        match log_probs.len() {
            0 => Ok(result),
            n if n == parts.len() => result.with_log_prob(Tensor::cat(&log_probs, 0)?),
            _ => Err(EngineError::LogProbMismatch),
        }
    }

    /// Attach `[rows, token_width]` log probabilities.
    pub fn with_log_prob(mut self, log_prob: Tensor) -> Result<Self> {
        let rows = self.num_rows()?;
        let lp_rows = log_prob.dims().first().copied().unwrap_or(0);
        if lp_rows != rows {
            return Err(EngineError::InvalidLayout(format!(
                "log_prob has {lp_rows} rows, buffer has {rows}"
            )));
        }
        self.log_prob = Some(log_prob);
        Ok(self)
    }

    pub fn data(&self) -> &Tensor {
        &self.data
    }

    pub fn tokens_idx(&self) -> ColumnRange {
        self.tokens_idx
    }

    pub fn valid_idx(&self) -> ColumnRange {
        self.valid_idx
    }

    pub fn length_idx(&self) -> ColumnRange {
        self.length_idx
    }

    pub fn samples_per_slot(&self) -> usize {
        self.samples_per_slot
    }

    pub fn log_prob(&self) -> Option<&Tensor> {
        self.log_prob.as_ref()
    }

    pub fn num_rows(&self) -> Result<usize> {
        Ok(self.data.dim(0)?)
    }

    /// Logical slots covered by this buffer.
    pub fn num_slots(&self) -> Result<usize> {
        Ok(self.num_rows()? / self.samples_per_slot)
    }

    /// The `samples_per_slot` rows owned by `slot`.
    pub fn get_result_at_slot(&self, slot: usize) -> Result<SlotData> {
        self.check_slot(slot)?;
        let rows = self
            .data
            .narrow(0, slot * self.samples_per_slot, self.samples_per_slot)?;
        let log_prob = match &self.log_prob {
            Some(lp) => Some(lp.narrow(0, slot * self.samples_per_slot, self.samples_per_slot)?),
            None => None,
        };
        self.slice_columns(&rows, log_prob)
    }

    /// Row groups of several, possibly non-contiguous, slots in the given order.
    pub fn get_result_at_slots(&self, slots: &[usize]) -> Result<SlotData> {
        let mut row_ids = Vec::with_capacity(slots.len() * self.samples_per_slot);
        for &slot in slots {
            self.check_slot(slot)?;
            let first = slot * self.samples_per_slot;
            row_ids.extend((first..first + self.samples_per_slot).map(|r| r as u32));
        }
        let n = row_ids.len();
        let ids = Tensor::from_vec(row_ids, n, self.data.device())?;
        let rows = self.data.index_select(&ids, 0)?;
        let log_prob = match &self.log_prob {
            Some(lp) => Some(lp.index_select(&ids.to_device(lp.device())?, 0)?),
            None => None,
        };
        self.slice_columns(&rows, log_prob)
    }

    /// Start copying the buffer to host memory without blocking.
    ///
    /// Host-resident buffers resolve immediately. The caller synchronizes
    /// through [`HostTransfer::wait`] before reading.
    pub fn copy_to_host_async(&self) -> HostTransfer {
        if self.data.device().is_cpu() {
            return HostTransfer::Ready(self.data.clone());
        }
        let data = self.data.clone();
        HostTransfer::Pending(thread::spawn(move || data.to_device(&Device::Cpu)))
    }

    /// Host-resident copy with identical index metadata.
    pub fn to_host(&self) -> Result<Self> {
        self.complete_host_copy(self.copy_to_host_async())
    }

    /// Wait for `transfer`, started from this buffer, and rebuild the buffer
    /// around the host copy.
    pub fn complete_host_copy(&self, transfer: HostTransfer) -> Result<Self> {
        let data = transfer.wait()?;
        if data.dims() != self.data.dims() {
            return Err(EngineError::InvalidLayout(format!(
                "host copy has shape {:?}, buffer has {:?}",
                data.dims(),
                self.data.dims()
            )));
        }
        let log_prob = match &self.log_prob {
            Some(lp) => Some(lp.to_device(&Device::Cpu)?),
            None => None,
        };
        Ok(Self {
            data,
            tokens_idx: self.tokens_idx,
            valid_idx: self.valid_idx,
            length_idx: self.length_idx,
            samples_per_slot: self.samples_per_slot,
            log_prob,
        })
    }

    fn check_slot(&self, slot: usize) -> Result<()> {
        let num_slots = self.num_slots()?;
        if slot >= num_slots {
            return Err(EngineError::SlotOutOfRange { slot, num_slots });
        }
        Ok(())
    }

    fn slice_columns(&self, rows: &Tensor, log_prob: Option<Tensor>) -> Result<SlotData> {
        let t = self.tokens_idx;
        let v = self.valid_idx;
        if rows.dim(0)? == 0 {
            // A column view of an empty tensor keeps a start offset past its storage.
            let device = rows.device();
            return Ok(SlotData {
                tokens: Tensor::zeros((0, t.len()), DType::I64, device)?,
                valid: Tensor::zeros((0, v.len()), DType::I64, device)?,
                lengths: Tensor::zeros(0, DType::I64, device)?,
                log_prob,
            });
        }
        // Lengths are replicated across the range; column 0 is authoritative.
        let lengths = rows.narrow(1, self.length_idx.start, 1)?.squeeze(1)?;
        Ok(SlotData {
            tokens: rows.narrow(1, t.start, t.len())?,
            valid: rows.narrow(1, v.start, v.len())?,
            lengths,
            log_prob,
        })
    }
}

fn validate_layout(
    rows: usize,
    width: usize,
    tokens_idx: ColumnRange,
    valid_idx: ColumnRange,
    length_idx: ColumnRange,
    samples_per_slot: usize,
) -> Result<()> {
    let named = [
        ("tokens_idx", tokens_idx),
        ("valid_idx", valid_idx),
        ("length_idx", length_idx),
    ];
    for (name, range) in named {
        if range.is_empty() || range.end > width {
            return Err(EngineError::InvalidLayout(format!(
                "{name} [{}, {}) is empty or exceeds width {width}",
                range.start, range.end
            )));
        }
    }
    for (i, (a_name, a)) in named.iter().enumerate() {
        for (b_name, b) in &named[i + 1..] {
            if a.overlaps(b) {
                return Err(EngineError::InvalidLayout(format!(
                    "{a_name} and {b_name} overlap"
                )));
            }
        }
    }
    if samples_per_slot == 0 || rows % samples_per_slot != 0 {
        return Err(EngineError::InvalidLayout(format!(
            "{rows} rows cannot be split into slots of {samples_per_slot} samples"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(rows: &[[i64; 3]], samples_per_slot: usize) -> ResultTokens {
        let flat: Vec<i64> = rows.iter().flatten().copied().collect();
        let data = Tensor::from_vec(flat, (rows.len(), 3), &Device::Cpu).unwrap();
        ResultTokens::new(data, (0, 1), (1, 2), (2, 3), samples_per_slot).unwrap()
    }

    fn four_slots() -> ResultTokens {
        buffer(&[[5, 1, 3], [7, 1, 1], [0, 0, 0], [9, 1, 5]], 1)
    }

    #[test]
    fn slot_view_slices_each_region() {
        let result = four_slots();
        let slot = result.get_result_at_slot(1).unwrap();
        assert_eq!(slot.tokens.to_vec2::<i64>().unwrap(), vec![vec![7]]);
        assert_eq!(slot.valid.to_vec2::<i64>().unwrap(), vec![vec![1]]);
        assert_eq!(slot.lengths.to_vec1::<i64>().unwrap(), vec![1]);
        assert!(slot.log_prob.is_none());
    }

    #[test]
    fn free_slot_reads_as_invalid() {
        let slot = four_slots().get_result_at_slot(2).unwrap();
        assert_eq!(slot.tokens.to_vec2::<i64>().unwrap(), vec![vec![0]]);
        assert_eq!(slot.valid.to_vec2::<i64>().unwrap(), vec![vec![0]]);
        assert_eq!(slot.lengths.to_vec1::<i64>().unwrap(), vec![0]);
    }

    #[test]
    fn slot_out_of_range_is_rejected() {
        let err = four_slots().get_result_at_slot(4).unwrap_err();
        assert!(matches!(
            err,
            EngineError::SlotOutOfRange {
                slot: 4,
                num_slots: 4
            }
        ));
        assert!(four_slots().get_result_at_slots(&[0, 9]).is_err());
    }

    #[test]
    fn slots_gather_in_given_order() {
        let slots = four_slots().get_result_at_slots(&[3, 0]).unwrap();
        assert_eq!(slots.tokens.to_vec2::<i64>().unwrap(), vec![vec![9], vec![5]]);
        assert_eq!(slots.lengths.to_vec1::<i64>().unwrap(), vec![5, 3]);
    }

    #[test]
    fn empty_slot_list_gathers_nothing() {
        let view = four_slots().get_result_at_slots(&[]).unwrap();
        assert_eq!(view.num_rows().unwrap(), 0);
        assert_eq!(view.tokens.dims(), &[0, 1]);
        assert!(view.to_samples().unwrap().is_empty());

        let data = Tensor::from_vec(vec![0.5f32, 0.25, 0.125, 0.0625], (4, 1), &Device::Cpu).unwrap();
        let with_lp = four_slots().with_log_prob(data).unwrap();
        let view = with_lp.get_result_at_slots(&[]).unwrap();
        assert!(view.to_samples().unwrap().is_empty());
    }

    #[test]
    fn multi_sample_slots_return_their_row_group() {
        // 2 slots x 3 samples
        let result = buffer(
            &[
                [11, 1, 1],
                [12, 0, 1],
                [13, 1, 1],
                [21, 1, 2],
                [22, 1, 2],
                [23, 1, 2],
            ],
            3,
        );
        assert_eq!(result.num_slots().unwrap(), 2);
        let slot = result.get_result_at_slot(1).unwrap();
        assert_eq!(
            slot.tokens.to_vec2::<i64>().unwrap(),
            vec![vec![21], vec![22], vec![23]]
        );
        let gathered = result.get_result_at_slots(&[1]).unwrap();
        assert_eq!(
            gathered.tokens.to_vec2::<i64>().unwrap(),
            slot.tokens.to_vec2::<i64>().unwrap()
        );
        let first = result.get_result_at_slot(0).unwrap().to_samples().unwrap();
        assert_eq!(
            first.iter().map(|s| s.valid[0]).collect::<Vec<_>>(),
            vec![true, false, true]
        );
    }

    #[test]
    fn lengths_read_first_column_of_wide_range() {
        // tokens [0,2), valid [2,4), lengths [4,6) replicated, one reserved column
        let data = Tensor::from_vec(
            vec![1i64, 2, 1, 1, 6, 6, -1, 3, 4, 1, 0, 8, 9, -1],
            (2, 7),
            &Device::Cpu,
        )
        .unwrap();
        let result = ResultTokens::new(data, (0, 2), (2, 4), (4, 6), 1).unwrap();
        let slot = result.get_result_at_slot(1).unwrap();
        assert_eq!(slot.lengths.to_vec1::<i64>().unwrap(), vec![8]);
        assert_eq!(slot.tokens.to_vec2::<i64>().unwrap(), vec![vec![3, 4]]);
    }

    #[test]
    fn overlapping_ranges_are_rejected() {
        let data = Tensor::zeros((4, 3), DType::I64, &Device::Cpu).unwrap();
        let err = ResultTokens::new(data, (0, 2), (1, 2), (2, 3), 1).unwrap_err();
        assert!(matches!(err, EngineError::InvalidLayout(_)));
    }

    #[test]
    fn range_past_width_is_rejected() {
        let data = Tensor::zeros((4, 3), DType::I64, &Device::Cpu).unwrap();
        assert!(ResultTokens::new(data, (0, 1), (1, 2), (2, 4), 1).is_err());
    }

    #[test]
    fn rows_must_divide_into_slots() {
        let data = Tensor::zeros((4, 3), DType::I64, &Device::Cpu).unwrap();
        assert!(ResultTokens::new(data.clone(), (0, 1), (1, 2), (2, 3), 3).is_err());
        assert!(ResultTokens::new(data, (0, 1), (1, 2), (2, 3), 0).is_err());
    }

    #[test]
    fn log_prob_rows_follow_slot_selection() {
        let lp = Tensor::from_vec(vec![-0.1f32, -0.2, -0.3, -0.4], (4, 1), &Device::Cpu).unwrap();
        let result = four_slots().with_log_prob(lp).unwrap();
        let slots = result.get_result_at_slots(&[2, 1]).unwrap();
        assert_eq!(
            slots.log_prob.unwrap().to_vec2::<f32>().unwrap(),
            vec![vec![-0.3], vec![-0.2]]
        );
        let single = result.get_result_at_slot(3).unwrap();
        assert_eq!(
            single.log_prob.unwrap().to_vec2::<f32>().unwrap(),
            vec![vec![-0.4]]
        );
    }

    #[test]
    fn log_prob_row_count_must_match() {
        let lp = Tensor::zeros((3, 1), DType::F32, &Device::Cpu).unwrap();
        assert!(four_slots().with_log_prob(lp).is_err());
    }

    #[test]
    fn pack_builds_canonical_layout() {
        let tokens = Tensor::from_vec(vec![4u32, 8], (2, 1), &Device::Cpu).unwrap();
        let valid = Tensor::from_vec(vec![1u8, 0], (2, 1), &Device::Cpu).unwrap();
        let lengths = Tensor::from_vec(vec![2u32, 0], 2, &Device::Cpu).unwrap();
        let result = ResultTokens::pack(&tokens, &valid, &lengths, 1).unwrap();
        assert_eq!(result.tokens_idx(), ColumnRange::new(0, 1));
        assert_eq!(result.valid_idx(), ColumnRange::new(1, 2));
        assert_eq!(result.length_idx(), ColumnRange::new(2, 3));
        assert_eq!(
            result.data().to_vec2::<i64>().unwrap(),
            vec![vec![4, 1, 2], vec![8, 0, 0]]
        );
    }

    #[test]
    fn from_samples_matches_manual_buffer() {
        let samples = vec![
            SlotSample::single(5, true, 3),
            SlotSample::single(7, true, 1),
            SlotSample::single(0, false, 0),
            SlotSample::single(9, true, 5),
        ];
        let built = ResultTokens::from_samples(&samples, 1, &Device::Cpu).unwrap();
        assert_eq!(
            built.data().to_vec2::<i64>().unwrap(),
            four_slots().data().to_vec2::<i64>().unwrap()
        );
        assert_eq!(
            built.get_result_at_slots(&[0, 1, 2, 3]).unwrap().to_samples().unwrap(),
            samples
        );
    }

    #[test]
    fn from_samples_rejects_partial_log_probs() {
        let samples = vec![
            SlotSample::single(1, true, 1).with_log_prob(vec![-1.0]),
            SlotSample::single(2, true, 1),
        ];
        assert!(matches!(
            ResultTokens::from_samples(&samples, 1, &Device::Cpu),
            Err(EngineError::LogProbMismatch)
        ));
    }

    #[test]
    fn microbatches_address_as_one_batch() {
        let whole = four_slots();
        let head = buffer(&[[5, 1, 3], [7, 1, 1]], 1);
        let tail = buffer(&[[0, 0, 0], [9, 1, 5]], 1);
        let stitched = ResultTokens::concat_microbatches(&[head, tail]).unwrap();
        for slot in 0..4 {
            assert_eq!(
                stitched.get_result_at_slot(slot).unwrap().to_samples().unwrap(),
                whole.get_result_at_slot(slot).unwrap().to_samples().unwrap()
            );
        }
    }

    #[test]
    fn microbatches_must_share_layout() {
        let a = buffer(&[[1, 1, 1], [2, 1, 1]], 1);
        let b = buffer(&[[1, 1, 1], [2, 1, 1]], 2);
        assert!(ResultTokens::concat_microbatches(&[a, b]).is_err());
        assert!(ResultTokens::concat_microbatches(&[]).is_err());
    }

    #[test]
    fn host_copy_is_idempotent() {
        let lp = Tensor::zeros((4, 1), DType::F32, &Device::Cpu).unwrap();
        let result = four_slots().with_log_prob(lp).unwrap();
        let once = result.to_host().unwrap();
        let twice = once.to_host().unwrap();
        assert_eq!(twice.tokens_idx(), result.tokens_idx());
        assert_eq!(twice.valid_idx(), result.valid_idx());
        assert_eq!(twice.length_idx(), result.length_idx());
        assert_eq!(twice.samples_per_slot(), result.samples_per_slot());
        assert!(twice.log_prob().is_some());
        assert_eq!(
            twice.data().to_vec2::<i64>().unwrap(),
            once.data().to_vec2::<i64>().unwrap()
        );
    }

    #[test]
    fn host_transfer_of_cpu_buffer_is_immediate() {
        let result = four_slots();
        let transfer = result.copy_to_host_async();
        assert!(transfer.is_ready());
        let host = transfer.wait().unwrap();
        assert_eq!(host.dims(), &[4, 3]);
    }

    #[test]
    fn completed_transfer_keeps_layout() {
        let lp = Tensor::from_vec(vec![-0.5f32, -1.0, -1.5, -2.0], (4, 1), &Device::Cpu).unwrap();
        let result = four_slots().with_log_prob(lp).unwrap();
        let host = result
            .complete_host_copy(result.copy_to_host_async())
            .unwrap();
        assert_eq!(host.tokens_idx(), result.tokens_idx());
        assert_eq!(host.samples_per_slot(), 1);
        assert_eq!(
            host.get_result_at_slots(&[0, 3]).unwrap().to_samples().unwrap(),
            result.get_result_at_slots(&[0, 3]).unwrap().to_samples().unwrap()
        );
    }

    #[test]
    fn transfer_from_another_buffer_is_rejected() {
        let result = four_slots();
        let other = buffer(&[[1, 1, 1], [2, 1, 1]], 1);
        let err = result
            .complete_host_copy(other.copy_to_host_async())
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidLayout(_)));
    }

    #[test]
    fn column_range_overlap() {
        let a = ColumnRange::new(0, 2);
        assert!(a.overlaps(&ColumnRange::new(1, 3)));
        assert!(!a.overlaps(&ColumnRange::new(2, 3)));
        assert_eq!(ColumnRange::from((3, 5)).len(), 2);
    }
}
