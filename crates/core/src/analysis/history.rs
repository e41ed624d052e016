/// Fixed-capacity FIFO of recent bass energies. Storage is allocated once;
/// once full, each push overwrites the oldest value.
#[derive(Debug, Clone)]
pub struct EnergyHistory {
    values: Vec<f32>,
    capacity: usize,
    head: usize,
}

impl EnergyHistory {
    /// Creates an empty history holding at most `capacity` energies.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            values: Vec::with_capacity(capacity),
            capacity,
            head: 0,
        }
    }

    /// Appends an energy, evicting the oldest when full.
    pub fn push(&mut self, energy: f32) {
        if self.values.len() < self.capacity {
            self.values.push(energy);
        } else {
            self.values[self.head] = energy;
            self.head = (self.head + 1) % self.capacity;
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.values.len() == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Empties the history without releasing its buffer.
    pub fn clear(&mut self) {
        self.values.clear();
        self.head = 0;
    }

    /// Values from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = f32> + '_ {
        let (newer, older) = self.values.split_at(self.head);
        older.iter().chain(newer.iter()).copied()
    }

    /// Accumulated in `f64` so a window of identical values has exactly that
    /// value as its mean and zero variance.
    pub fn mean(&self) -> f32 {
        self.mean_f64() as f32
    }

    /// Population variance around [`EnergyHistory::mean`].
    pub fn variance(&self) -> f32 {
        if self.values.is_empty() {
            return 0.0;
        }
        let mean = self.mean_f64();
        let sum: f64 = self
            .values
            .iter()
            .map(|value| (f64::from(*value) - mean).powi(2))
            .sum();
        (sum / self.values.len() as f64) as f32
    }

    fn mean_f64(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.values.iter().copied().map(f64::from).sum();
        sum / self.values.len() as f64
    }
}
