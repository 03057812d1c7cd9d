//! Device-side cache-length advancement for multi-step decode.
//!
//! Between model invocations of one fetch/step episode the per-row cache
//! lengths must grow by each row's token count. Doing that on the host would
//! force a device synchronization and defeat multi-step execution, so the
//! update is a precompiled kernel loaded once at manager construction. The
//! produced tensors are handed straight to the next invocation; the host
//! never reads them.

use tracing::debug;

use crate::cache::inputs::{KVCacheInputs, PaddedKVCacheInputs, RaggedKVCacheInputs};
use crate::error::{Error, Result};
use crate::session::{CompiledKernel, DeviceTensor, InferenceSession, KernelGraph, KernelValue};

/// Model inputs of the previous invocation that drive the increment.
#[derive(Debug, Clone)]
pub enum PrevStepInputs {
    /// Ragged path: the batch's row offsets, u32 `[batch + 1]`, device-resident.
    Ragged { input_row_offsets: DeviceTensor },
    /// Padded path: the `[batch, seq_len]` token tensor fed to the step.
    Padded { tokens: DeviceTensor },
}

/// Precompiled cache-length advancement, ragged or padded.
pub struct CacheLengthIncrementer {
    kernel: Box<dyn CompiledKernel>,
    is_ragged: bool,
}

impl CacheLengthIncrementer {
    pub fn load(
        session: &dyn InferenceSession,
        is_ragged: bool,
        num_devices: usize,
    ) -> Result<Self> {
        let graph = if is_ragged {
            KernelGraph::UpdateCacheLengths { num_devices }
        } else {
            KernelGraph::UpdateStartPos
        };
        Ok(Self {
            kernel: session.load(graph)?,
            is_ragged,
        })
    }

    pub fn is_ragged(&self) -> bool {
        self.is_ragged
    }

    /// Produce the inputs for the next invocation of the episode.
    pub fn increment(&self, inputs: KVCacheInputs, prev: &PrevStepInputs) -> Result<KVCacheInputs> {
        match (inputs, prev) {
            (KVCacheInputs::Ragged(inputs), PrevStepInputs::Ragged { input_row_offsets }) => Ok(
                KVCacheInputs::Ragged(self.increment_ragged(inputs, input_row_offsets)?),
            ),
            (KVCacheInputs::Padded(inputs), PrevStepInputs::Padded { tokens }) => {
                Ok(KVCacheInputs::Padded(self.increment_padded(inputs, tokens)?))
            }
            _ => Err(Error::Protocol(
                "cache inputs and previous model inputs disagree on layout".into(),
            )),
        }
    }

    /// Advance each row's cache length by its row-offset delta and drop the
    /// consumed row of `max_lengths`. Blocks and lookup tables pass through.
    pub fn increment_ragged(
        &self,
        inputs: Vec<RaggedKVCacheInputs>,
        input_row_offsets: &DeviceTensor,
    ) -> Result<Vec<RaggedKVCacheInputs>> {
        if !self.is_ragged {
            return Err(Error::Protocol(
                "padded incrementer cannot drive ragged inputs".into(),
            ));
        }
        let mut args = vec![KernelValue::Tensor(input_row_offsets.clone())];
        args.extend(
            inputs
                .iter()
                .map(|input| KernelValue::Tensor(input.cache_lengths.clone())),
        );
        let updated = self.kernel.execute(&args)?;
        if updated.len() != inputs.len() {
            return Err(Error::Protocol(format!(
                "update_cache_lengths produced {} tensors for {} devices",
                updated.len(),
                inputs.len()
            )));
        }
        debug!(num_devices = inputs.len(), "advanced cache lengths on device");
        Ok(inputs
            .into_iter()
            .zip(updated)
            .map(|(input, cache_lengths)| RaggedKVCacheInputs {
                blocks: input.blocks,
                cache_lengths,
                lookup_table: input.lookup_table,
                max_lengths: input.max_lengths.get(1..).unwrap_or(&[]).to_vec(),
            })
            .collect())
    }

    /// Legacy padded path: `start_pos + seq_len`, computed on device.
    pub fn increment_padded(
        &self,
        inputs: Vec<PaddedKVCacheInputs>,
        tokens: &DeviceTensor,
    ) -> Result<Vec<PaddedKVCacheInputs>> {
        if self.is_ragged {
            return Err(Error::Protocol(
                "ragged incrementer cannot drive padded inputs".into(),
            ));
        }
        if inputs.len() != 1 {
            return Err(Error::Protocol(
                "padded cache inputs are single-device".into(),
            ));
        }
        let input = &inputs[0];
        let produced = self.kernel.execute(&[
            KernelValue::Tensor(input.start_pos.clone()),
            KernelValue::Tensor(tokens.clone()),
        ])?;
        let new_start_pos = produced
            .into_iter()
            .next()
            .ok_or_else(|| Error::Protocol("update_start_pos produced no output".into()))?;
        Ok(vec![PaddedKVCacheInputs {
            k_cache: input.k_cache.clone(),
            v_cache: input.v_cache.clone(),
            start_pos: new_start_pos.clone(),
            null_op: new_start_pos,
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::inputs::KVCacheInputsSequence;
    use crate::session::{Device, HostSession};

    #[test]
    fn test_ragged_increment_and_row_consumption() {
        let session = HostSession::new();
        let device = Device::cpu();
        let incrementer = CacheLengthIncrementer::load(&session, true, 1).unwrap();

        let blocks = session.alloc(&device, &[4, 2], 2).unwrap();
        let cache_lengths = session.upload_u32(&device, &[2], &[0, 10]).unwrap();
        let lookup_table = session.upload_u32(&device, &[2, 2], &[0, 1, 2, 3]).unwrap();
        let inputs = vec![RaggedKVCacheInputs {
            blocks,
            cache_lengths,
            lookup_table,
            max_lengths: vec![[3, 10], [1, 13]],
        }];
        // rows 0 and 1 processed 3 and 2 tokens respectively
        let offsets = session.upload_u32(&device, &[3], &[0, 3, 5]).unwrap();

        let next = incrementer.increment_ragged(inputs, &offsets).unwrap();
        assert_eq!(session.read_u32(&next[0].cache_lengths).unwrap(), vec![3, 12]);
        assert_eq!(next[0].max_lengths, vec![[1, 13]]);

        let done = incrementer.increment_ragged(next, &offsets).unwrap();
        assert_eq!(session.read_u32(&done[0].cache_lengths).unwrap(), vec![6, 14]);
        assert!(done[0].max_lengths.is_empty());

        // a multi-step episode batches one input set per invocation
        let episode = KVCacheInputsSequence {
            kv_cache_inputs: vec![KVCacheInputs::Ragged(done)],
        };
        assert_eq!(episode.kv_cache_inputs[0].num_devices(), 1);
    }

    #[test]
    fn test_padded_increment() {
        let session = HostSession::new();
        let device = Device::cpu();
        let incrementer = CacheLengthIncrementer::load(&session, false, 1).unwrap();

        let k_cache = session.alloc(&device, &[2, 2], 2).unwrap();
        let v_cache = session.alloc(&device, &[2, 2], 2).unwrap();
        let start_pos = session.upload_i64(&device, &[], &[4]).unwrap();
        let tokens = session.upload_i64(&device, &[2, 3], &[0; 6]).unwrap();
        let inputs = vec![PaddedKVCacheInputs {
            k_cache,
            v_cache,
            start_pos: start_pos.clone(),
            null_op: start_pos,
        }];

        let next = incrementer
            .increment(KVCacheInputs::Padded(inputs), &PrevStepInputs::Padded { tokens })
            .unwrap();
        let KVCacheInputs::Padded(next) = next else {
            panic!("layout changed");
        };
        assert_eq!(session.read_i64(&next[0].start_pos).unwrap(), vec![7]);
    }

    #[test]
    fn test_layout_mismatch_is_rejected() {
        let session = HostSession::new();
        let device = Device::cpu();
        let incrementer = CacheLengthIncrementer::load(&session, true, 1).unwrap();
        let tokens = session.upload_i64(&device, &[1, 1], &[0]).unwrap();
        let result = incrementer.increment(
            KVCacheInputs::Ragged(Vec::new()),
            &PrevStepInputs::Padded { tokens },
        );
        assert!(matches!(result, Err(Error::Protocol(_))));
    }
}
