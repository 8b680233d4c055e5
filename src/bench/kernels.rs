//! Synthetic workload kernels
//!
//! Each kernel burns CPU or churns the heap for a bounded amount of work and
//! returns an opaque checksum so the optimizer cannot elide the computation.
//! Kernels keep no state between calls; the only thing that survives an
//! invocation is what the caller's [`KernelScratch`] explicitly retains.
//!
//! Every heap buffer a kernel builds goes through a fallible reservation, so
//! an exhausted allocator surfaces as [`KernelError::AllocationFailed`]
//! instead of aborting the process. Long loops poll the scratch's
//! cancellation token and return early once it fires.

use crate::StressOrbError;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt::{self, Write as _};
use std::hint::black_box;
use std::mem::size_of;
use tokio_util::sync::CancellationToken;

const LARGE_OBJECT_BYTES: usize = 1024 * 1024;
const TOUCH_STRIDE: usize = 1024;
/// Inner iterations between cancellation checks
const CANCEL_CHECK_INTERVAL: u32 = 4096;

/// Bounded working-set policy for allocation kernels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Number of retained items that triggers a trim
    pub max_retained: usize,
    /// Number of oldest items discarded per trim
    pub discard_batch: usize,
}

impl RetentionPolicy {
    pub fn new(max_retained: usize, discard_batch: usize) -> Self {
        Self {
            max_retained,
            discard_batch,
        }
    }

    /// Retain nothing: every allocation becomes garbage immediately
    pub fn none() -> Self {
        Self::new(0, 0)
    }
}

/// Workload kernel variants with their parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkloadKernel {
    /// Transcendental floating point loop plus integer arithmetic
    MathCompute { iterations: u32 },
    /// Trial-division primality checks on random candidates
    PrimeCheck {
        candidates: u32,
        range_start: u64,
        range_end: u64,
    },
    /// Iterative Fibonacci up to `n`
    Fibonacci { n: u32 },
    /// Dense square matrix multiplication
    MatrixMultiply { size: usize },
    /// Bulk byte-buffer allocation with a bounded retained set
    ByteAllocation {
        chunk_bytes: usize,
        chunks_per_invocation: u32,
        retention: RetentionPolicy,
    },
    /// Mixed short-lived, long-lived and large object allocation
    MixedAllocationPattern {
        rounds: u32,
        array_len: usize,
        include_strings: bool,
        include_collections: bool,
        include_large_objects: bool,
        retention: RetentionPolicy,
    },
}

impl WorkloadKernel {
    /// Short machine-friendly kernel name
    pub fn name(&self) -> &'static str {
        match self {
            WorkloadKernel::MathCompute { .. } => "math",
            WorkloadKernel::PrimeCheck { .. } => "prime",
            WorkloadKernel::Fibonacci { .. } => "fibonacci",
            WorkloadKernel::MatrixMultiply { .. } => "matrix",
            WorkloadKernel::ByteAllocation { .. } => "bytes",
            WorkloadKernel::MixedAllocationPattern { .. } => "mixed",
        }
    }

    /// Get a human-readable description of the kernel
    pub fn description(&self) -> &'static str {
        match self {
            WorkloadKernel::MathCompute { .. } => "Math Compute",
            WorkloadKernel::PrimeCheck { .. } => "Prime Check",
            WorkloadKernel::Fibonacci { .. } => "Fibonacci",
            WorkloadKernel::MatrixMultiply { .. } => "Matrix Multiply",
            WorkloadKernel::ByteAllocation { .. } => "Byte Allocation",
            WorkloadKernel::MixedAllocationPattern { .. } => "Mixed Allocation Pattern",
        }
    }
}

/// Result of one kernel invocation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelOutcome {
    /// Work units performed; zero means the invocation did nothing
    pub units: u64,
    /// Opaque value that keeps the computation observable
    pub checksum: u64,
    /// Bytes requested from the allocator during the invocation
    pub bytes_allocated: u64,
}

impl KernelOutcome {
    /// Outcome of an invocation whose parameters asked for no work
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn is_idle(&self) -> bool {
        self.units == 0
    }
}

/// Runtime resource failure inside a kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    /// The allocator refused a reservation
    AllocationFailed { requested: usize },
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::AllocationFailed { requested } => {
                write!(f, "allocation of {} bytes failed", requested)
            }
        }
    }
}

impl std::error::Error for KernelError {}

impl From<KernelError> for StressOrbError {
    fn from(err: KernelError) -> Self {
        StressOrbError::WorkerResourceError(err.to_string())
    }
}

/// A unit of work the timed worker loop can invoke repeatedly
pub trait Workload: Send {
    /// Perform one unit of work
    fn invoke(&self, scratch: &mut KernelScratch) -> Result<KernelOutcome, KernelError>;

    /// True when the parameters ask for no work at all
    fn is_noop(&self) -> bool {
        false
    }
}

impl Workload for WorkloadKernel {
    fn invoke(&self, scratch: &mut KernelScratch) -> Result<KernelOutcome, KernelError> {
        match self {
            WorkloadKernel::MathCompute { iterations } => Ok(math_compute(scratch, *iterations)),
            WorkloadKernel::PrimeCheck {
                candidates,
                range_start,
                range_end,
            } => Ok(prime_check(scratch, *candidates, *range_start, *range_end)),
            WorkloadKernel::Fibonacci { n } => Ok(fibonacci_kernel(scratch, *n)),
            WorkloadKernel::MatrixMultiply { size } => matrix_multiply(scratch, *size),
            WorkloadKernel::ByteAllocation {
                chunk_bytes,
                chunks_per_invocation,
                retention,
            } => byte_allocation(scratch, *chunk_bytes, *chunks_per_invocation, retention),
            WorkloadKernel::MixedAllocationPattern { .. } => mixed_allocation(scratch, self),
        }
    }

    fn is_noop(&self) -> bool {
        match self {
            WorkloadKernel::MathCompute { iterations } => *iterations == 0,
            WorkloadKernel::PrimeCheck {
                candidates,
                range_start,
                range_end,
            } => *candidates == 0 || range_start >= range_end,
            WorkloadKernel::Fibonacci { n } => *n == 0,
            WorkloadKernel::MatrixMultiply { size } => *size == 0,
            WorkloadKernel::ByteAllocation {
                chunk_bytes,
                chunks_per_invocation,
                ..
            } => *chunk_bytes == 0 || *chunks_per_invocation == 0,
            WorkloadKernel::MixedAllocationPattern { rounds, .. } => *rounds == 0,
        }
    }
}

/// Items an allocation kernel may keep alive across invocations.
///
/// The payloads are only held, never read: keeping them reachable is the point.
#[derive(Debug)]
#[allow(dead_code)]
enum Retained {
    Chunk(Vec<u8>),
    Text(String),
    Record(CustomerRecord),
}

/// Per-worker invocation context: a private RNG, the retained working set
/// and the token that interrupts long invocations
pub struct KernelScratch {
    rng: SmallRng,
    retained: VecDeque<Retained>,
    cancel: CancellationToken,
}

impl KernelScratch {
    /// Create a scratch with a fixed seed, or from entropy when `None`
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };
        Self {
            rng,
            retained: VecDeque::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Interrupt invocations once `cancel` fires
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn rng(&mut self) -> &mut SmallRng {
        &mut self.rng
    }

    /// True once the owning worker has been told to stop
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn poll_cancel(&self, step: u32) -> bool {
        step % CANCEL_CHECK_INTERVAL == 0 && self.is_cancelled()
    }

    /// Number of items currently kept alive
    pub fn retained_items(&self) -> usize {
        self.retained.len()
    }

    fn retain(&mut self, item: Retained, policy: &RetentionPolicy) {
        if policy.max_retained == 0 {
            return;
        }
        self.retained.push_back(item);
        if self.retained.len() > policy.max_retained {
            let overflow = self.retained.len() - policy.max_retained;
            let discard = policy.discard_batch.max(overflow).min(self.retained.len());
            self.retained.drain(..discard);
        }
    }
}

/// Floating point and integer arithmetic with no heap allocation
pub fn math_compute(scratch: &mut KernelScratch, iterations: u32) -> KernelOutcome {
    if iterations == 0 {
        return KernelOutcome::idle();
    }

    let mut x = scratch.rng.gen::<f64>() * 1000.0;
    let mut done = 0u32;
    while done < iterations {
        if scratch.poll_cancel(done) {
            break;
        }
        x = x.sin() * x.cos() + x.abs().sqrt();
        x = x.abs().powf(0.5) + (x.abs() + 1.0).ln();
        x = x.atan() + (x / 10_000.0).exp();
        done += 1;
    }

    let mut sum: u64 = 0;
    for i in 0..(done / 10).max(1) as u64 {
        sum = sum.wrapping_add(i.wrapping_mul(i).wrapping_mul(i)) % 1_000_000;
    }

    KernelOutcome {
        units: done as u64,
        checksum: black_box(x).to_bits() ^ black_box(sum),
        bytes_allocated: 0,
    }
}

/// 6k±1 trial division
pub fn is_prime(n: u64) -> bool {
    if n <= 1 {
        return false;
    }
    if n <= 3 {
        return true;
    }
    if n % 2 == 0 || n % 3 == 0 {
        return false;
    }
    let mut i = 5u64;
    while i.saturating_mul(i) <= n {
        if n % i == 0 || n % (i + 2) == 0 {
            return false;
        }
        i += 6;
    }
    true
}

/// Check `candidates` random numbers from `[range_start, range_end)`
pub fn prime_check(
    scratch: &mut KernelScratch,
    candidates: u32,
    range_start: u64,
    range_end: u64,
) -> KernelOutcome {
    if candidates == 0 || range_start >= range_end {
        return KernelOutcome::idle();
    }

    let mut primes = 0u64;
    let mut done = 0u32;
    while done < candidates {
        // one candidate can take thousands of divisions
        if done % 64 == 0 && scratch.is_cancelled() {
            break;
        }
        let candidate = scratch.rng.gen_range(range_start..range_end);
        if is_prime(black_box(candidate)) {
            primes += 1;
        }
        done += 1;
    }

    KernelOutcome {
        units: done as u64,
        checksum: primes,
        bytes_allocated: 0,
    }
}

/// Iterative Fibonacci, stepping until `n` or until `stop` says so.
///
/// Returns the last value and the index it belongs to. Wraps on overflow
/// since only the cost matters.
fn fibonacci_until(n: u32, stop: impl Fn(u32) -> bool) -> (u64, u32) {
    if n <= 1 {
        return (n as u64, n);
    }
    let (mut a, mut b) = (0u64, 1u64);
    let mut index = 1u32;
    while index < n {
        if stop(index) {
            break;
        }
        let next = a.wrapping_add(b);
        a = b;
        b = next;
        index += 1;
    }
    (b, index)
}

fn fibonacci_kernel(scratch: &KernelScratch, n: u32) -> KernelOutcome {
    if n == 0 {
        return KernelOutcome::idle();
    }
    let (value, reached) = fibonacci_until(black_box(n), |step| scratch.poll_cancel(step));
    KernelOutcome {
        units: reached as u64,
        checksum: value,
        bytes_allocated: 0,
    }
}

/// Reserve room for exactly `len` elements or report the failed request
fn try_vec<T>(len: usize) -> Result<Vec<T>, KernelError> {
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(len)
        .map_err(|_| KernelError::AllocationFailed {
            requested: len.saturating_mul(size_of::<T>()),
        })?;
    Ok(buffer)
}

/// Format into a string whose buffer was reserved fallibly up front
fn try_text(capacity: usize, args: fmt::Arguments<'_>) -> Result<String, KernelError> {
    let mut text = String::new();
    text.try_reserve_exact(capacity)
        .map_err(|_| KernelError::AllocationFailed { requested: capacity })?;
    // writing into a String only fails if a Display impl does
    let _ = text.write_fmt(args);
    Ok(text)
}

/// Multiply two random `size × size` matrices
pub fn matrix_multiply(scratch: &mut KernelScratch, size: usize) -> Result<KernelOutcome, KernelError> {
    if size == 0 {
        return Ok(KernelOutcome::idle());
    }

    let cells = size.checked_mul(size).ok_or(KernelError::AllocationFailed {
        requested: usize::MAX,
    })?;
    let mut a: Vec<f64> = try_vec(cells)?;
    let mut b: Vec<f64> = try_vec(cells)?;
    let mut c: Vec<f64> = try_vec(cells)?;
    let rng = &mut scratch.rng;
    a.extend((0..cells).map(|_| rng.gen::<f64>()));
    b.extend((0..cells).map(|_| rng.gen::<f64>()));
    c.resize(cells, 0.0);

    let mut rows = 0usize;
    for i in 0..size {
        if scratch.is_cancelled() {
            break;
        }
        rows += 1;
        for k in 0..size {
            let aik = a[i * size + k];
            let row_b = &b[k * size..(k + 1) * size];
            let row_c = &mut c[i * size..(i + 1) * size];
            for (cij, bkj) in row_c.iter_mut().zip(row_b) {
                *cij += aik * bkj;
            }
        }
    }

    let checksum: f64 = (0..rows).map(|i| c[i * size]).sum();

    Ok(KernelOutcome {
        units: (rows * size * size) as u64,
        checksum: black_box(checksum).to_bits(),
        bytes_allocated: (3 * cells * size_of::<f64>()) as u64,
    })
}

fn allocate_chunk(len: usize, marker: u8) -> Result<Vec<u8>, KernelError> {
    let mut chunk = try_vec(len)?;
    chunk.resize(len, 0u8);
    for byte in chunk.iter_mut().step_by(TOUCH_STRIDE) {
        *byte = marker;
    }
    Ok(chunk)
}

/// Allocate `chunks` buffers of `chunk_bytes` and retain them per `retention`
pub fn byte_allocation(
    scratch: &mut KernelScratch,
    chunk_bytes: usize,
    chunks: u32,
    retention: &RetentionPolicy,
) -> Result<KernelOutcome, KernelError> {
    if chunk_bytes == 0 || chunks == 0 {
        return Ok(KernelOutcome::idle());
    }

    let mut checksum = 0u64;
    let mut done = 0u32;
    while done < chunks {
        if scratch.is_cancelled() {
            break;
        }
        let marker = scratch.rng.gen::<u8>();
        let chunk = allocate_chunk(chunk_bytes, marker)?;
        checksum = checksum.wrapping_add(chunk[0] as u64);
        scratch.retain(Retained::Chunk(chunk), retention);
        done += 1;
    }

    Ok(KernelOutcome {
        units: done as u64,
        checksum,
        bytes_allocated: chunk_bytes as u64 * done as u64,
    })
}

#[derive(Debug)]
struct OrderItem {
    item_id: String,
    description: String,
    price: f64,
    quantity: u32,
}

#[derive(Debug)]
struct Order {
    order_id: u64,
    amount: f64,
    items: Vec<OrderItem>,
}

#[derive(Debug)]
struct CustomerRecord {
    id: u64,
    name: String,
    email: String,
    orders: Vec<Order>,
}

const ORDERS_PER_RECORD: u64 = 5;
const LABEL_CAPACITY: usize = 48;

impl CustomerRecord {
    fn generate(rng: &mut SmallRng, id: u64) -> Result<Self, KernelError> {
        let mut orders = try_vec(ORDERS_PER_RECORD as usize)?;
        for order_idx in 0..ORDERS_PER_RECORD {
            let mut items = try_vec(order_idx as usize + 1)?;
            for item_idx in 0..=order_idx {
                items.push(OrderItem {
                    item_id: try_text(LABEL_CAPACITY, format_args!("ITEM_{}", item_idx))?,
                    description: try_text(
                        LABEL_CAPACITY,
                        format_args!("Product description for item {}", item_idx),
                    )?,
                    price: rng.gen::<f64>() * 100.0,
                    quantity: rng.gen_range(1..=10),
                });
            }
            orders.push(Order {
                order_id: id * 1000 + order_idx,
                amount: rng.gen::<f64>() * 1000.0,
                items,
            });
        }

        Ok(Self {
            id,
            name: try_text(LABEL_CAPACITY, format_args!("Customer_{}", id))?,
            email: try_text(LABEL_CAPACITY, format_args!("customer{}@example.com", id))?,
            orders,
        })
    }

    fn heap_size(&self) -> u64 {
        let items: usize = self
            .orders
            .iter()
            .flat_map(|o| &o.items)
            .map(|i| i.item_id.capacity() + i.description.capacity())
            .sum();
        let item_structs: usize = self.orders.iter().map(|o| o.items.capacity()).sum::<usize>()
            * size_of::<OrderItem>();
        (self.name.capacity()
            + self.email.capacity()
            + self.orders.capacity() * size_of::<Order>()
            + item_structs
            + items) as u64
    }

    fn fingerprint(&self) -> u64 {
        let quantities: u64 = self
            .orders
            .iter()
            .flat_map(|o| &o.items)
            .map(|i| i.quantity as u64 + i.price as u64)
            .sum();
        let amounts: u64 = self.orders.iter().map(|o| o.order_id + o.amount as u64).sum();
        self.id ^ quantities ^ amounts
    }
}

#[derive(Debug)]
struct TreeNode {
    level: u32,
    label: String,
    children: Vec<TreeNode>,
}

impl TreeNode {
    fn build(depth: u32, seed: u64, fanout: u64) -> Result<Self, KernelError> {
        let mut children = Vec::new();
        if depth > 1 {
            children = try_vec(fanout as usize)?;
            for i in 0..fanout {
                children.push(TreeNode::build(depth - 1, seed * 10 + i, 2)?);
            }
        }
        Ok(Self {
            level: depth,
            label: try_text(LABEL_CAPACITY, format_args!("Node_{}_{}", seed, depth))?,
            children,
        })
    }

    fn count(&self) -> u64 {
        1 + self.children.iter().map(TreeNode::count).sum::<u64>()
    }
}

const MIXED_TEXT_PIECES: usize = 50;

/// Mixed allocation pattern modelled on a typical request-handling heap
/// profile: mostly short-lived garbage with a trickle of survivors.
fn mixed_allocation(
    scratch: &mut KernelScratch,
    kernel: &WorkloadKernel,
) -> Result<KernelOutcome, KernelError> {
    let WorkloadKernel::MixedAllocationPattern {
        rounds,
        array_len,
        include_strings,
        include_collections,
        include_large_objects,
        retention,
    } = kernel
    else {
        return Ok(KernelOutcome::idle());
    };

    if *rounds == 0 {
        return Ok(KernelOutcome::idle());
    }

    let mut bytes = 0u64;
    let mut checksum = 0u64;
    let mut done = 0u64;

    for round in 0..*rounds as u64 {
        if scratch.is_cancelled() {
            break;
        }
        done += 1;

        // short-lived arrays
        let mut array: Vec<i64> = try_vec(*array_len)?;
        array.extend((0..*array_len as i64).map(|j| j.wrapping_mul(round as i64)));
        bytes += (array.len() * size_of::<i64>()) as u64;
        checksum = checksum.wrapping_add(black_box(array.last().copied().unwrap_or(0)) as u64);

        if *include_strings && round % 10 == 0 {
            let mut text = try_text(MIXED_TEXT_PIECES * LABEL_CAPACITY, format_args!(""))?;
            for k in 0..MIXED_TEXT_PIECES {
                let _ = write!(text, "User_{}_Request_{}_Data", round, k);
            }
            bytes += text.len() as u64;
            checksum = checksum.wrapping_add(text.len() as u64);
            if round % 100 == 0 {
                scratch.retain(Retained::Text(text), retention);
            }
        }

        if *include_collections && round % 20 == 0 {
            let record = CustomerRecord::generate(&mut scratch.rng, round)?;
            bytes += record.heap_size();
            checksum = checksum.wrapping_add(record.fingerprint());
            if round % 500 == 0 {
                scratch.retain(Retained::Record(record), retention);
            }
        }

        if *include_large_objects && round % 1000 == 0 {
            let large = allocate_chunk(LARGE_OBJECT_BYTES, (round % 256) as u8)?;
            bytes += large.len() as u64;
            checksum = checksum.wrapping_add(large[0] as u64);
        }

        if round % 50 == 0 {
            let tree = TreeNode::build(3, round, 3)?;
            bytes += tree.count() * size_of::<TreeNode>() as u64;
            checksum = checksum.wrapping_add(black_box(&tree).level as u64 + tree.label.len() as u64);
        }
    }

    Ok(KernelOutcome {
        units: done,
        checksum,
        bytes_allocated: bytes,
    })
}
