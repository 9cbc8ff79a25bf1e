/// Boolean that flips on every evaluation
#[derive(Debug, Clone)]
pub struct BooleanToggle {
    current: bool,
}

impl BooleanToggle {
    pub fn new(initial: bool) -> Self {
        Self { current: initial }
    }

    pub fn next(&mut self) -> bool {
        self.current = !self.current;
        self.current
    }
}
