use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

#[derive(Debug, Clone)]
pub struct DatasetInterleaver {
    base: Vec<usize>,
    order: Vec<usize>,
    seed: u64,
}

impl DatasetInterleaver {
    pub fn new(batch_counts: &[usize], seed: u64) -> Self {
        let base: Vec<usize> = batch_counts
            .iter()
            .enumerate()
            .flat_map(|(dataset, &count)| std::iter::repeat(dataset).take(count))
            .collect();
        Self {
            order: base.clone(),
            base,
            seed,
        }
    }

    pub fn len(&self) -> usize {
        self.base.len()
    }

    pub fn is_empty(&self) -> bool {
        self.base.is_empty()
    }

    pub fn epoch_order(&mut self, epoch: usize) -> &[usize] {
        self.order.clone_from(&self.base);
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
        self.order.shuffle(&mut rng);
        &self.order
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(order: &[usize], datasets: usize) -> Vec<usize> {
        let mut counts = vec![0; datasets];
        for &idx in order {
            counts[idx] += 1;
        }
        counts
    }

    #[test]
    fn every_dataset_appears_its_batch_count() {
        for seed in 0..25 {
            let mut interleaver = DatasetInterleaver::new(&[3, 1, 0, 6], seed);
            for epoch in 0..4 {
                let order = interleaver.epoch_order(epoch);
                assert_eq!(order.len(), 10);
                assert_eq!(counts(order, 4), vec![3, 1, 0, 6]);
            }
        }
    }

    #[test]
    fn order_is_deterministic_per_epoch() {
        let mut a = DatasetInterleaver::new(&[5, 5], 7);
        let mut b = DatasetInterleaver::new(&[5, 5], 7);

        let first = a.epoch_order(3).to_vec();
        b.epoch_order(0);
        b.epoch_order(1);
        assert_eq!(b.epoch_order(3), first.as_slice());

        let orders: Vec<Vec<usize>> = (0..8).map(|e| a.epoch_order(e).to_vec()).collect();
        assert!(orders.windows(2).any(|pair| pair[0] != pair[1]));
    }

    #[test]
    fn empty_datasets_yield_an_empty_epoch() {
        let mut interleaver = DatasetInterleaver::new(&[0, 0], 1);
        assert!(interleaver.is_empty());
        assert!(interleaver.epoch_order(0).is_empty());
    }
}
