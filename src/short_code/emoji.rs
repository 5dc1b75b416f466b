/// One symbol of an emoji short code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EmojiRepresentation {
    /// Emoji glyph.
    pub emoji: &'static str,
    /// English name shown next to the glyph.
    pub name: &'static str,
}

const fn e(emoji: &'static str, name: &'static str) -> EmojiRepresentation {
    EmojiRepresentation { emoji, name }
}

/// The 64 symbols a 6-bit group maps to.
pub const EMOJI_TABLE: [EmojiRepresentation; 64] = [
    e("🐶", "Dog"), e("🐱", "Cat"), e("🦁", "Lion"), e("🐴", "Horse"),
    e("🦄", "Unicorn"), e("🐷", "Pig"), e("🐘", "Elephant"), e("🐰", "Rabbit"),
    e("🐼", "Panda"), e("🐓", "Rooster"), e("🐧", "Penguin"), e("🐢", "Turtle"),
    e("🐟", "Fish"), e("🐙", "Octopus"), e("🦋", "Butterfly"), e("🌷", "Flower"),
    e("🌳", "Tree"), e("🌵", "Cactus"), e("🍄", "Mushroom"), e("🌏", "Globe"),
    e("🌙", "Moon"), e("☁️", "Cloud"), e("🔥", "Fire"), e("🍌", "Banana"),
    e("🍎", "Apple"), e("🍓", "Strawberry"), e("🌽", "Corn"), e("🍕", "Pizza"),
    e("🎂", "Cake"), e("❤️", "Heart"), e("😀", "Smiley"), e("🤖", "Robot"),
    e("🎩", "Hat"), e("👓", "Glasses"), e("🔧", "Spanner"), e("🎅", "Santa"),
    e("👍", "Thumbs Up"), e("☂️", "Umbrella"), e("⌛", "Hourglass"), e("⏰", "Clock"),
    e("🎁", "Gift"), e("💡", "Light Bulb"), e("📕", "Book"), e("✏️", "Pencil"),
    e("📎", "Paperclip"), e("✂️", "Scissors"), e("🔒", "Lock"), e("🔑", "Key"),
    e("🔨", "Hammer"), e("☎️", "Telephone"), e("🏁", "Flag"), e("🚂", "Train"),
    e("🚲", "Bicycle"), e("✈️", "Aeroplane"), e("🚀", "Rocket"), e("🏆", "Trophy"),
    e("⚽", "Ball"), e("🎸", "Guitar"), e("🎺", "Trumpet"), e("🔔", "Bell"),
    e("⚓", "Anchor"), e("🎧", "Headphones"), e("📁", "Folder"), e("📌", "Pin"),
];
