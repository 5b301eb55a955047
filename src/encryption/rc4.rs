use anyhow::bail;

/// RC4 keystream generator. NEX keys range from 5 bytes ("CD&ML") to 32 bytes (derived
///  substream keys), so the key length is only checked at runtime.
#[derive(Clone)]
pub struct Rc4 {
    state: [u8; 256],
    i: u8,
    j: u8,
}

impl Rc4 {
    pub fn new(key: &[u8]) -> anyhow::Result<Rc4> {
        if key.is_empty() || key.len() > 256 {
            bail!("invalid RC4 key length {}", key.len());
        }
        Ok(Self::schedule(key))
    }

    /// key scheduling without the length check, for keys that are known to be valid
    pub(crate) fn schedule(key: &[u8]) -> Rc4 {
        let mut state = [0u8; 256];
        for (idx, s) in state.iter_mut().enumerate() {
            *s = idx as u8;
        }

        let mut j = 0u8;
        for (i, &k) in (0..256).zip(key.iter().cycle()) {
            j = j.wrapping_add(state[i]).wrapping_add(k);
            state.swap(i, j as usize);
        }

        Rc4 { state, i: 0, j: 0 }
    }

    /// XORs the keystream into the buffer, advancing the cipher state
    pub fn apply_keystream(&mut self, data: &mut [u8]) {
        for b in data.iter_mut() {
            self.i = self.i.wrapping_add(1);
            self.j = self.j.wrapping_add(self.state[self.i as usize]);
            self.state.swap(self.i as usize, self.j as usize);
            let idx = self.state[self.i as usize].wrapping_add(self.state[self.j as usize]);
            *b ^= self.state[idx as usize];
        }
    }

    pub fn process(&mut self, data: &[u8]) -> Vec<u8> {
        let mut result = data.to_vec();
        self.apply_keystream(&mut result);
        result
    }
}
