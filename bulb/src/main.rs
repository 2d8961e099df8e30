mod host;
mod leds;
mod mqtt;
mod web;

fn main() -> anyhow::Result<()> {
    host::run()
}
