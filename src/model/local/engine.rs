use rand::{Rng as _, SeedableRng as _, rngs::StdRng};
use tvm_runtime::Tensor;

use super::{kv_cache::PagedKvCache, vm::TvmVm};
use crate::{Error, Result};

/// Length of the shared prefix between the materialized history and the new
/// prompt; everything past it must be rewound and re-prefilled.
pub(crate) fn longest_common_prefix(history: &[u32], tokens: &[u32]) -> usize {
    history
        .iter()
        .zip(tokens.iter())
        .take_while(|(h, t)| h == t)
        .count()
}

/// The autoregressive engine: owns the VM, the paged KV cache and the token
/// history mirroring what the cache has materialized.
///
/// Not reentrant. All calls for one engine are serialized by its owner; the
/// worker loop in `LocalLangModel` is that serialization point.
#[derive(Debug)]
pub(crate) struct LmEngine {
    vm: TvmVm,
    kv: PagedKvCache,
    history: Vec<u32>,
    rng: StdRng,
}

impl LmEngine {
    pub fn new(vm: TvmVm, kv: PagedKvCache) -> Self {
        Self {
            vm,
            kv,
            history: Vec::new(),
            rng: StdRng::from_entropy(),
        }
    }

    pub fn prefill_chunk_size(&self) -> usize {
        self.kv.prefill_chunk_size as usize
    }

    /// Re-seed the sampler for a turn. Entropy-seeded when `seed` is absent.
    pub fn reseed(&mut self, seed: Option<u64>) {
        self.rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
    }

    pub fn clear(&mut self) -> Result<()> {
        self.kv.clear()?;
        self.history.clear();
        Ok(())
    }

    /// Make the KV cache reflect `tokens`, reusing the longest common prefix
    /// with the previous conversation.
    pub fn prefill(&mut self, tokens: &[u32]) -> Result<()> {
        // The history is only trustworthy while it agrees with the cache.
        if self.kv.total_sequence_length()? != self.history.len() as i64 {
            self.clear()?;
        }

        let lcp = longest_common_prefix(&self.history, tokens);
        if lcp < self.history.len() {
            self.kv.popn((self.history.len() - lcp) as i64)?;
            self.history.truncate(lcp);
        }

        let tail: Vec<i32> = tokens[lcp..].iter().map(|t| *t as i32).collect();
        if tail.is_empty() {
            return Ok(());
        }

        let available = self.kv.available_pages()? * self.kv.page_size;
        if tail.len() as i64 >= available {
            return Err(Error::ContextOverflow {
                requested: tail.len(),
                available: available.max(0) as usize,
            });
        }

        let chunk_size = self.prefill_chunk_size();
        for chunk in tail.chunks(chunk_size) {
            let embedding = self.vm.embed(chunk)?;
            self.kv.begin_forward(chunk.len() as i64)?;
            let result = self.vm.prefill_step(&embedding, self.kv.state());
            self.kv.end_forward()?;
            result?;
            self.history
                .extend(chunk.iter().map(|t| *t as u32));
        }

        Ok(())
    }

    /// Advance one token; returns host logits of shape `[1, 1, vocab]`.
    pub fn decode(&mut self, last_token: u32) -> Result<Tensor> {
        if self.kv.available_pages()? < 1 {
            return Err(Error::ContextOverflow {
                requested: 1,
                available: 0,
            });
        }
        let embedding = self.vm.embed(&[last_token as i32])?;
        self.kv.begin_forward(1)?;
        let result = self.vm.decode_step(&embedding, self.kv.state());
        self.kv.end_forward()?;
        result
    }

    /// Sample from logits and append the pick to history.
    pub fn sample(&mut self, logits: Tensor, temperature: f64, top_p: f64) -> Result<u32> {
        let threshold: f64 = self.rng.r#gen();
        let token = self.vm.sample_top_p(logits, temperature, top_p, threshold)?;
        self.history.push(token);
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::longest_common_prefix;

    #[test]
    fn lcp_basics() {
        assert_eq!(longest_common_prefix(&[], &[1, 2]), 0);
        assert_eq!(longest_common_prefix(&[1, 2, 3], &[1, 2, 4]), 2);
        assert_eq!(longest_common_prefix(&[1, 2], &[1, 2, 3, 4]), 2);
        assert_eq!(longest_common_prefix(&[1, 2, 3], &[1, 2, 3]), 3);
        assert_eq!(longest_common_prefix(&[9], &[1]), 0);
    }
}
