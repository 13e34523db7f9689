//! WeightedScheduler - smooth weighted round-robin over queues
//!
//! # アルゴリズム
//! 1. pull ごとに全 queue の credit を weight だけ増やす
//! 2. credit 最大の queue を選ぶ（同点は宣言順で先のもの）
//! 3. 選んだ queue の credit から weight 合計を引く
//!
//! weight 合計 W 回の pull ごとに、各 queue はちょうど weight 回選ばれます。
//! 選ばれた queue が空でも他の queue を続けて試すので、低 weight の queue も
//! 飢餓しません。

use std::sync::{Mutex, PoisonError};

use crate::domain::{QueueConfig, QueueName};

#[derive(Debug)]
pub struct WeightedScheduler {
    queues: Vec<QueueName>,
    weights: Vec<i64>,
    total: i64,
    credits: Mutex<Vec<i64>>,
}

impl WeightedScheduler {
    pub fn new(queues: &[QueueConfig]) -> Self {
        let weights: Vec<i64> = queues.iter().map(|q| i64::from(q.weight)).collect();
        Self {
            queues: queues.iter().map(|q| q.name.clone()).collect(),
            total: weights.iter().sum(),
            credits: Mutex::new(vec![0; weights.len()]),
            weights,
        }
    }

    /// Pull order for one pop: the picked queue, then the rest in
    /// declaration order.
    pub fn next_order(&self) -> Vec<QueueName> {
        let Some(picked) = self.pick() else {
            return self.queues.clone();
        };

        let mut order = Vec::with_capacity(self.queues.len());
        order.push(self.queues[picked].clone());
        order.extend(
            self.queues
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != picked)
                .map(|(_, q)| q.clone()),
        );
        order
    }

    pub fn queues(&self) -> &[QueueName] {
        &self.queues
    }

    fn pick(&self) -> Option<usize> {
        if self.queues.is_empty() || self.total <= 0 {
            return None;
        }
        // 短いクリティカルセクションのみ。await を跨がない
        let mut credits = self.credits.lock().unwrap_or_else(PoisonError::into_inner);

        let mut best = 0;
        for (i, weight) in self.weights.iter().enumerate() {
            credits[i] += weight;
            if credits[i] > credits[best] {
                best = i;
            }
        }
        credits[best] -= self.total;
        Some(best)
    }
}
