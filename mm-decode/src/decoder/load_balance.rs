// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

/// Where and how to order one submission when decoding across several
/// queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadBalanceTicket {
    pub queue_index: u32,
    /// The shared timeline value to wait for before decoding.
    pub wait_value: u64,
    /// The shared timeline value to signal once decoding is done.
    pub signal_value: u64,
}

/// Round-robins submissions across decode queues, ordering them with a
/// single timeline semaphore: submission `n` waits for `n - 1` and signals
/// `n`.
#[derive(Debug, Clone)]
pub struct LoadBalancer {
    queue_count: u32,
    next_queue: u32,
    counter: u64,
}

impl LoadBalancer {
    pub fn new(queue_count: u32) -> Self {
        Self {
            queue_count: queue_count.max(1),
            next_queue: 0,
            counter: 0,
        }
    }

    pub fn next(&mut self) -> LoadBalanceTicket {
        self.counter += 1;

        let queue_index = self.next_queue;
        self.next_queue = (self.next_queue + 1) % self.queue_count;

        LoadBalanceTicket {
            queue_index,
            wait_value: self.counter - 1,
            signal_value: self.counter,
        }
    }

    /// The number of submissions so far.
    pub fn counter(&self) -> u64 {
        self.counter
    }
}
