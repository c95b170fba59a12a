//! Data records written to the ECU during programming

use chrono::{Datelike, Timelike};

use crate::error::FlashError;
use crate::firmware::MemoryBlock;

/// Largest value representable in the 3-byte fields of the prepare record
const MAX_24_BIT: u32 = 0x00FF_FFFF;

/// Two decimal digits as one BCD byte (`59` -> `0x59`)
fn bcd(value: u32) -> u8 {
    let value = value % 100;
    (((value / 10) << 4) | (value % 10)) as u8
}

/// Programming date record: year (2 bytes), month, day, hour, minute,
/// second, each written as BCD digits
///
/// 2026-10-17 09:05:42 becomes `20 26 10 17 09 05 42`.
pub fn programming_date_record<T>(datetime: &T) -> [u8; 7]
where
    T: Datelike + Timelike,
{
    let year = datetime.year().rem_euclid(10_000) as u32;
    [
        bcd(year / 100),
        bcd(year % 100),
        bcd(datetime.month()),
        bcd(datetime.day()),
        bcd(datetime.hour()),
        bcd(datetime.minute()),
        bcd(datetime.second()),
    ]
}

/// Address/size record sent with the prepare-block routine:
/// `00 A2 A1 A0 00 S2 S1 S0`
pub fn prepare_block_record(block: &MemoryBlock) -> Result<[u8; 8], FlashError> {
    let size = block.size();
    if block.address > MAX_24_BIT || size > MAX_24_BIT {
        return Err(FlashError::InvalidImage(format!(
            "block {} does not fit the 24-bit prepare record",
            block
        )));
    }

    let [_, a2, a1, a0] = block.address.to_be_bytes();
    let [_, s2, s1, s0] = size.to_be_bytes();
    Ok([0x00, a2, a1, a0, 0x00, s2, s1, s0])
}

/// Routine option record carrying the boot image entry address
pub fn boot_entry_record(block: &MemoryBlock) -> [u8; 4] {
    block.address.to_be_bytes()
}
