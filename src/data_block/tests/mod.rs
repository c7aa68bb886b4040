mod tests_slots;
