//! Short authentication codes rendered from the SAS bytes.
//!
//! Decimal packs the first 5 bytes into three numbers in `1000..=9191`.
//! Emoji packs the 6 bytes into seven 6-bit indices into a fixed 64-entry
//! table shared by all implementations. The table order is part of the
//! protocol and must not change.

use crate::sas::SAS_BYTES_LEN;

/// One entry of the emoji table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Emoji {
    pub symbol: &'static str,
    pub description: &'static str,
}

/// The 64 emoji, indexed by 6-bit value.
pub const EMOJI_TABLE: [Emoji; 64] = [
    Emoji { symbol: "🐶", description: "Dog" },
    Emoji { symbol: "🐱", description: "Cat" },
    Emoji { symbol: "🦁", description: "Lion" },
    Emoji { symbol: "🐎", description: "Horse" },
    Emoji { symbol: "🦄", description: "Unicorn" },
    Emoji { symbol: "🐷", description: "Pig" },
    Emoji { symbol: "🐘", description: "Elephant" },
    Emoji { symbol: "🐰", description: "Rabbit" },
    Emoji { symbol: "🐼", description: "Panda" },
    Emoji { symbol: "🐓", description: "Rooster" },
    Emoji { symbol: "🐧", description: "Penguin" },
    Emoji { symbol: "🐢", description: "Turtle" },
    Emoji { symbol: "🐟", description: "Fish" },
    Emoji { symbol: "🐙", description: "Octopus" },
    Emoji { symbol: "🦋", description: "Butterfly" },
    Emoji { symbol: "🌷", description: "Flower" },
    Emoji { symbol: "🌳", description: "Tree" },
    Emoji { symbol: "🌵", description: "Cactus" },
    Emoji { symbol: "🍄", description: "Mushroom" },
    Emoji { symbol: "🌏", description: "Globe" },
    Emoji { symbol: "🌙", description: "Moon" },
    Emoji { symbol: "☁️", description: "Cloud" },
    Emoji { symbol: "🔥", description: "Fire" },
    Emoji { symbol: "🍌", description: "Banana" },
    Emoji { symbol: "🍎", description: "Apple" },
    Emoji { symbol: "🍓", description: "Strawberry" },
    Emoji { symbol: "🌽", description: "Corn" },
    Emoji { symbol: "🍕", description: "Pizza" },
    Emoji { symbol: "🎂", description: "Cake" },
    Emoji { symbol: "❤️", description: "Heart" },
    Emoji { symbol: "😀", description: "Smiley" },
    Emoji { symbol: "🤖", description: "Robot" },
    Emoji { symbol: "🎩", description: "Hat" },
    Emoji { symbol: "👓", description: "Glasses" },
    Emoji { symbol: "🔧", description: "Spanner" },
    Emoji { symbol: "🎅", description: "Santa" },
    Emoji { symbol: "👍", description: "Thumbs Up" },
    Emoji { symbol: "☂️", description: "Umbrella" },
    Emoji { symbol: "⌛", description: "Hourglass" },
    Emoji { symbol: "⏰", description: "Clock" },
    Emoji { symbol: "🎁", description: "Gift" },
    Emoji { symbol: "💡", description: "Light Bulb" },
    Emoji { symbol: "📕", description: "Book" },
    Emoji { symbol: "✏️", description: "Pencil" },
    Emoji { symbol: "📎", description: "Paperclip" },
    Emoji { symbol: "✂️", description: "Scissors" },
    Emoji { symbol: "🔒", description: "Lock" },
    Emoji { symbol: "🔑", description: "Key" },
    Emoji { symbol: "🔨", description: "Hammer" },
    Emoji { symbol: "☎️", description: "Telephone" },
    Emoji { symbol: "🏁", description: "Flag" },
    Emoji { symbol: "🚂", description: "Train" },
    Emoji { symbol: "🚲", description: "Bicycle" },
    Emoji { symbol: "✈️", description: "Aeroplane" },
    Emoji { symbol: "🚀", description: "Rocket" },
    Emoji { symbol: "🏆", description: "Trophy" },
    Emoji { symbol: "⚽", description: "Ball" },
    Emoji { symbol: "🎸", description: "Guitar" },
    Emoji { symbol: "🎺", description: "Trumpet" },
    Emoji { symbol: "🔔", description: "Bell" },
    Emoji { symbol: "⚓", description: "Anchor" },
    Emoji { symbol: "🎧", description: "Headphones" },
    Emoji { symbol: "📁", description: "Folder" },
    Emoji { symbol: "📌", description: "Pin" },
];

/// Three four-digit numbers from the first 5 SAS bytes.
pub fn decimal_code(bytes: &[u8; SAS_BYTES_LEN]) -> [u16; 3] {
    let b: [u16; 5] = [
        u16::from(bytes[0]),
        u16::from(bytes[1]),
        u16::from(bytes[2]),
        u16::from(bytes[3]),
        u16::from(bytes[4]),
    ];
    [
        (b[0] << 5 | b[1] >> 3) + 1000,
        ((b[1] & 0x7) << 10 | b[2] << 2 | b[3] >> 6) + 1000,
        ((b[3] & 0x3f) << 7 | b[4] >> 1) + 1000,
    ]
}

/// Seven emoji from the 6 SAS bytes, via 6-bit table indices.
pub fn emoji_code(bytes: &[u8; SAS_BYTES_LEN]) -> [Emoji; 7] {
    let indices = [
        bytes[0] >> 2,
        (bytes[0] & 0x3) << 4 | bytes[1] >> 4,
        (bytes[1] & 0xf) << 2 | bytes[2] >> 6,
        bytes[2] & 0x3f,
        bytes[3] >> 2,
        (bytes[3] & 0x3) << 4 | bytes[4] >> 4,
        (bytes[4] & 0xf) << 2 | bytes[5] >> 6,
    ];
    indices.map(|i| EMOJI_TABLE[usize::from(i)])
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn zero_bytes_give_lowest_codes() {
        let bytes = [0u8; 6];
        assert_eq!(decimal_code(&bytes), [1000, 1000, 1000]);
        assert!(emoji_code(&bytes).iter().all(|e| e.description == "Dog"));
    }

    #[test]
    fn max_bytes_give_highest_codes() {
        let bytes = [0xFF; 6];
        assert_eq!(decimal_code(&bytes), [9191, 9191, 9191]);
        assert!(emoji_code(&bytes).iter().all(|e| e.description == "Pin"));
    }

    #[test]
    fn known_vector() {
        let bytes = [0, 1, 2, 3, 4, 5];
        assert_eq!(decimal_code(&bytes), [1000, 2032, 1386]);

        let descriptions: Vec<&str> = emoji_code(&bytes)
            .iter()
            .map(|e| e.description)
            .collect();
        assert_eq!(
            descriptions,
            ["Dog", "Dog", "Unicorn", "Lion", "Dog", "Hammer", "Tree"]
        );
    }

    #[test]
    fn decimal_numbers_stay_in_range() {
        for byte in [0u8, 1, 42, 128, 200, 255] {
            let code = decimal_code(&[byte; 6]);
            assert!(code.iter().all(|n| (1000..=9191).contains(n)));
        }
    }

    #[test]
    fn table_has_unique_entries() {
        for (i, a) in EMOJI_TABLE.iter().enumerate() {
            for b in &EMOJI_TABLE[i + 1..] {
                assert_ne!(a.description, b.description);
                assert_ne!(a.symbol, b.symbol);
            }
        }
    }
}
