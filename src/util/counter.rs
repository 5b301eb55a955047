use parking_lot::Mutex;

/// A numeric type that a [Counter] can step through with wrap-around
pub trait CounterValue: Copy + Send + 'static {
    fn wrapping_next(self) -> Self;
}
macro_rules! counter_value_impl {
    ($($ty:ty),*) => {
        $(impl CounterValue for $ty {
            fn wrapping_next(self) -> Self {
                self.wrapping_add(1)
            }
        })*
    }
}
counter_value_impl!(u8, u16, u32, u64);

/// Thread-safe wrap-around counter. [Counter::next] increments first and returns the new value,
///  so a counter created with 0 hands out 1, 2, 3, ...
pub struct Counter<T: CounterValue> {
    value: Mutex<T>,
}

impl<T: CounterValue> Counter<T> {
    pub fn new(start: T) -> Counter<T> {
        Counter { value: Mutex::new(start) }
    }

    pub fn next(&self) -> T {
        let mut value = self.value.lock();
        *value = value.wrapping_next();
        *value
    }

    pub fn value(&self) -> T {
        *self.value.lock()
    }

    pub fn reset(&self, start: T) {
        *self.value.lock() = start;
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_next() {
        let counter = Counter::<u16>::new(0);
        assert_eq!(counter.next(), 1);
        assert_eq!(counter.next(), 2);
        assert_eq!(counter.value(), 2);

        counter.reset(0);
        assert_eq!(counter.next(), 1);
    }

    #[test]
    fn test_wrap_around() {
        let counter = Counter::<u8>::new(254);
        assert_eq!(counter.next(), 255);
        assert_eq!(counter.next(), 0);
        assert_eq!(counter.next(), 1);
    }

    #[test]
    fn test_concurrent_increments_are_unique() {
        let counter = Arc::new(Counter::<u32>::new(0));
        let handles = (0..4)
            .map(|_| {
                let counter = counter.clone();
                std::thread::spawn(move || (0..1000).map(|_| counter.next()).collect::<Vec<_>>())
            })
            .collect::<Vec<_>>();

        let mut all = handles.into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect::<Vec<_>>();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 4000);
        assert_eq!(counter.value(), 4000);
    }
}
