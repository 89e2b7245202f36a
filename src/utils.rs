use core::fmt;

/// Formats bytes as upper case hex pairs separated by spaces, the way
/// datasheets print JEDEC IDs.
pub struct HexSlice<T: AsRef<[u8]>>(pub T);

impl<T: AsRef<[u8]>> fmt::Debug for HexSlice<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sep = "";
        for byte in self.0.as_ref() {
            write!(f, "{}{:02X}", sep, byte)?;
            sep = " ";
        }
        Ok(())
    }
}
