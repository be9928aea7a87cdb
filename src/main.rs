fn main() -> anyhow::Result<()> {
    hud_coach_lib::run()
}
