fn main() {
    codex_relay::run();
}
