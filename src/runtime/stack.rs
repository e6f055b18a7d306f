use crate::runtime::runtime_error::VmError;

/// A fixed-size scalar that can live on the byte stack.
pub trait StackValue: Sized {
    const SIZE: u32;

    fn write(self, out: &mut [u8]);
    fn read(bytes: &[u8]) -> Self;
}

impl StackValue for u8 {
    const SIZE: u32 = 1;

    fn write(self, out: &mut [u8]) {
        out[0] = self;
    }

    fn read(bytes: &[u8]) -> Self {
        bytes[0]
    }
}

impl StackValue for bool {
    const SIZE: u32 = 1;

    fn write(self, out: &mut [u8]) {
        out[0] = u8::from(self);
    }

    fn read(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}

macro_rules! four_byte_value {
    ($ty:ty) => {
        impl StackValue for $ty {
            const SIZE: u32 = 4;

            fn write(self, out: &mut [u8]) {
                out[..4].copy_from_slice(&self.to_le_bytes());
            }

            fn read(bytes: &[u8]) -> Self {
                <$ty>::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
            }
        }
    };
}

four_byte_value!(i32);
four_byte_value!(u32);
four_byte_value!(f32);

/// The machine's byte-addressed stack. Every access is bounds checked: pushes against
/// the capacity, pops and memory accesses against the current top.
#[derive(Debug, Clone)]
pub struct Stack {
    memory: Vec<u8>,
    sp: u32,
}

impl Stack {
    pub fn new(capacity: u32) -> Self {
        Stack {
            memory: vec![0; capacity as usize],
            sp: 0,
        }
    }

    /// Bytes in use; also the address of the next push.
    pub fn sp(&self) -> u32 {
        self.sp
    }

    pub fn capacity(&self) -> u32 {
        self.memory.len() as u32
    }

    fn grow(&mut self, n: u32) -> Result<usize, VmError> {
        let available = self.capacity() - self.sp;
        if n > available {
            return Err(VmError::StackOverflow {
                requested: n,
                available,
                capacity: self.capacity(),
            });
        }
        let at = self.sp as usize;
        self.sp += n;
        Ok(at)
    }

    fn shrink(&mut self, n: u32) -> Result<usize, VmError> {
        if n > self.sp {
            return Err(VmError::StackUnderflow {
                requested: n,
                available: self.sp,
            });
        }
        self.sp -= n;
        Ok(self.sp as usize)
    }

    fn check(&self, address: u32, len: u32) -> Result<usize, VmError> {
        match address.checked_add(len) {
            Some(end) if end <= self.sp => Ok(address as usize),
            _ => Err(VmError::InvalidAddress {
                address: i64::from(address),
                len,
            }),
        }
    }

    pub fn push<T: StackValue>(&mut self, value: T) -> Result<(), VmError> {
        let at = self.grow(T::SIZE)?;
        value.write(&mut self.memory[at..at + T::SIZE as usize]);
        Ok(())
    }

    pub fn pop<T: StackValue>(&mut self) -> Result<T, VmError> {
        let at = self.shrink(T::SIZE)?;
        Ok(T::read(&self.memory[at..at + T::SIZE as usize]))
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) -> Result<(), VmError> {
        let at = self.grow(bytes.len() as u32)?;
        self.memory[at..at + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn push_zero(&mut self, n: u32) -> Result<(), VmError> {
        let at = self.grow(n)?;
        self.memory[at..at + n as usize].fill(0);
        Ok(())
    }

    pub fn drop_bytes(&mut self, n: u32) -> Result<(), VmError> {
        self.shrink(n).map(|_| ())
    }

    /// Copies `n` bytes at `address` onto the top of the stack.
    pub fn push_from(&mut self, address: u32, n: u32) -> Result<(), VmError> {
        let from = self.check(address, n)?;
        let at = self.grow(n)?;
        self.memory.copy_within(from..from + n as usize, at);
        Ok(())
    }

    /// Pops the top `n` bytes and writes them to `address`.
    pub fn pop_to(&mut self, address: u32, n: u32) -> Result<(), VmError> {
        let top = self.shrink(n)?;
        let to = self.check(address, n)?;
        self.memory.copy_within(top..top + n as usize, to);
        Ok(())
    }

    /// Moves the top `n` bytes down to `address` and makes them the new top.
    pub fn collapse_to(&mut self, address: u32, n: u32) -> Result<(), VmError> {
        let top = self.shrink(n)?;
        if address > self.sp {
            return Err(VmError::InvalidAddress {
                address: i64::from(address),
                len: n,
            });
        }
        self.memory.copy_within(top..top + n as usize, address as usize);
        self.sp = address + n;
        Ok(())
    }

    pub fn read(&self, address: u32, n: u32) -> Result<&[u8], VmError> {
        let at = self.check(address, n)?;
        Ok(&self.memory[at..at + n as usize])
    }

    pub fn read_value<T: StackValue>(&self, address: u32) -> Result<T, VmError> {
        self.read(address, T::SIZE).map(T::read)
    }

    /// The top `n` bytes, without popping them.
    pub fn top(&self, n: u32) -> Result<&[u8], VmError> {
        if n > self.sp {
            return Err(VmError::StackUnderflow {
                requested: n,
                available: self.sp,
            });
        }
        self.read(self.sp - n, n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_push_pop() {
        let mut stack = Stack::new(64);
        stack.push(-5i32).unwrap();
        stack.push(2.5f32).unwrap();
        stack.push(true).unwrap();
        stack.push(b'x').unwrap();
        assert_eq!(stack.sp(), 10);

        assert_eq!(stack.pop::<u8>().unwrap(), b'x');
        assert!(stack.pop::<bool>().unwrap());
        assert_eq!(stack.pop::<f32>().unwrap(), 2.5);
        assert_eq!(stack.pop::<i32>().unwrap(), -5);
        assert_eq!(stack.sp(), 0);
    }

    #[test]
    fn test_overflow_and_underflow() {
        let mut stack = Stack::new(6);
        stack.push(1u32).unwrap();
        assert_eq!(
            stack.push(2u32),
            Err(VmError::StackOverflow {
                requested: 4,
                available: 2,
                capacity: 6
            })
        );
        assert_eq!(stack.sp(), 4);

        stack.drop_bytes(4).unwrap();
        assert_eq!(
            stack.pop::<u8>(),
            Err(VmError::StackUnderflow {
                requested: 1,
                available: 0
            })
        );
    }

    #[test]
    fn test_memory_above_top_is_invalid() {
        let mut stack = Stack::new(32);
        stack.push_zero(8).unwrap();
        assert!(stack.read(4, 4).is_ok());
        assert_eq!(
            stack.read(6, 4),
            Err(VmError::InvalidAddress { address: 6, len: 4 })
        );
        assert!(stack.read(u32::MAX, 4).is_err());
        assert!(stack.push_from(8, 1).is_err());
    }

    #[test]
    fn test_copy_between_top_and_memory() {
        let mut stack = Stack::new(32);
        stack.push_zero(4).unwrap();
        stack.push(77i32).unwrap();
        stack.pop_to(0, 4).unwrap();
        assert_eq!(stack.read_value::<i32>(0).unwrap(), 77);

        stack.push_from(0, 4).unwrap();
        assert_eq!(stack.sp(), 8);
        assert_eq!(stack.pop::<i32>().unwrap(), 77);
    }

    #[test]
    fn test_collapse_moves_result_down() {
        let mut stack = Stack::new(32);
        stack.push_zero(12).unwrap();
        stack.push(9i32).unwrap();
        stack.collapse_to(2, 4).unwrap();
        assert_eq!(stack.sp(), 6);
        assert_eq!(stack.top(4).unwrap(), &9i32.to_le_bytes());
    }
}
