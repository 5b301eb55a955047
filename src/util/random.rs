use rand::RngCore;
#[cfg(test)] use std::sync::Mutex;


#[cfg(test)]
/// automock expectations for static methods are global - hold this lock to avoid races
pub static MOCK_RANDOM_MUTEX: Mutex<()> = Mutex::new(());

/// Source of the random values that go into session IDs, session keys and signature keys
#[cfg_attr(test, mockall::automock)]
pub trait Random {
    fn next_u8() -> u8;
    fn bytes(len: usize) -> Vec<u8>;
}
pub struct RngRandom {}
impl Random for RngRandom {
    fn next_u8() -> u8 {
        rand::thread_rng().next_u32() as u8
    }

    fn bytes(len: usize) -> Vec<u8> {
        let mut result = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut result);
        result
    }
}
